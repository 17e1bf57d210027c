//! Little-endian field readers shared by the fixed-layout GKDI structures.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Cursor over a packed structure. Every read records the field name and the
/// offset it failed at so parse errors stay diagnosable.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::invalid(field, self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u32_le(&mut self, field: &'static str) -> Result<u32> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub(crate) fn i32_le(&mut self, field: &'static str) -> Result<i32> {
        let bytes = self.take(4, field)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub(crate) fn uuid_le(&mut self, field: &'static str) -> Result<Uuid> {
        let bytes = self.take(16, field)?;
        Ok(Uuid::from_bytes_le(bytes.try_into().expect("16-byte slice")))
    }

    pub(crate) fn utf16_le(&mut self, len: usize, field: &'static str) -> Result<String> {
        let offset = self.pos;
        let bytes = self.take(len, field)?;
        decode_utf16_le(bytes, field, offset)
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Encode a string as UTF-16LE with the trailing NUL the wire formats expect.
pub(crate) fn utf16_le_nul(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .chain(core::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Decode a UTF-16LE string, dropping the trailing NUL code unit.
pub(crate) fn decode_utf16_le(bytes: &[u8], field: &'static str, offset: usize) -> Result<String> {
    if bytes.len() % 2 != 0 || bytes.len() < 2 {
        return Err(Error::invalid(field, offset));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let trimmed = match units.split_last() {
        Some((0, rest)) => rest,
        _ => return Err(Error::invalid(field, offset)),
    };
    String::from_utf16(trimmed).map_err(|_| Error::invalid(field, offset))
}
