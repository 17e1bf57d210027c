//! The `KDSK` key identifier embedded in every DPAPI-NG blob.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::wire::{utf16_le_nul, ByteReader};

/// Magic tag identifying a packed [`KeyIdentifier`].
pub const KEY_ID_MAGIC: [u8; 4] = *b"KDSK";

/// Size of the fixed portion preceding the three variable payloads.
pub const KEY_ID_HEADER_LEN: usize = 52;

/// Identifies one leaf of the GKDI seed tree.
///
/// This is the structure MS-GKDI `GetKey` consumes to locate the group key
/// seed values. It is not publicly documented by Microsoft but closely
/// mirrors the group key envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdentifier {
    /// Structure version, 1 on the wire today.
    pub version: u32,
    /// Bit 0 set means `key_info` carries an agreement public key.
    pub flags: u32,
    /// L0 index of the key.
    pub l0: i32,
    /// L1 index of the key.
    pub l1: i32,
    /// L2 index of the key.
    pub l2: i32,
    /// Root key this leaf descends from.
    pub root_key_id: Uuid,
    /// KDF context for symmetric leaves, packed FFC-DH public key otherwise.
    pub key_info: Vec<u8>,
    /// DNS domain name of the issuing domain.
    pub domain_name: String,
    /// DNS forest name of the issuing forest.
    pub forest_name: String,
}

impl KeyIdentifier {
    /// Whether `key_info` holds an ephemeral agreement public key.
    pub fn is_public_key(&self) -> bool {
        self.flags & 1 != 0
    }

    pub fn pack(&self) -> Vec<u8> {
        let domain = utf16_le_nul(&self.domain_name);
        let forest = utf16_le_nul(&self.forest_name);

        let mut out =
            Vec::with_capacity(KEY_ID_HEADER_LEN + self.key_info.len() + domain.len() + forest.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&KEY_ID_MAGIC);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.l0.to_le_bytes());
        out.extend_from_slice(&self.l1.to_le_bytes());
        out.extend_from_slice(&self.l2.to_le_bytes());
        out.extend_from_slice(&self.root_key_id.to_bytes_le());
        out.extend_from_slice(&(self.key_info.len() as u32).to_le_bytes());
        out.extend_from_slice(&(domain.len() as u32).to_le_bytes());
        out.extend_from_slice(&(forest.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key_info);
        out.extend_from_slice(&domain);
        out.extend_from_slice(&forest);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let version = reader.u32_le("version")?;
        if reader.take(4, "magic")? != KEY_ID_MAGIC {
            return Err(Error::invalid("magic", 4));
        }
        let flags = reader.u32_le("flags")?;
        let l0 = reader.i32_le("l0")?;
        let l1 = reader.i32_le("l1")?;
        let l2 = reader.i32_le("l2")?;
        let root_key_id = reader.uuid_le("root key id")?;
        let key_info_len = reader.u32_le("key info length")? as usize;
        let domain_len = reader.u32_le("domain length")? as usize;
        let forest_len = reader.u32_le("forest length")? as usize;

        let key_info = reader.take(key_info_len, "key info")?.to_vec();
        let domain_name = reader.utf16_le(domain_len, "domain name")?;
        let forest_name = reader.utf16_le(forest_len, "forest name")?;

        Ok(Self {
            version,
            flags,
            l0,
            l1,
            l2,
            root_key_id,
            key_info,
            domain_name,
            forest_name,
        })
    }
}
