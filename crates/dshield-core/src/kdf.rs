//! Key derivation primitives: SP800-108 in counter mode with an HMAC PRF,
//! the SP800-56A concatenation KDF used after secret agreement, and the
//! `msKds-KDFParam` blob that names the hash.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};
use crate::wire::{utf16_le_nul, ByteReader};

/// `L"KDS service"` with its NUL terminator, the label for every seed and
/// KEK derivation in MS-GKDI.
pub(crate) fn service_label() -> Vec<u8> {
    utf16_le_nul("KDS service")
}

/// Hash function selected by the root key's KDF parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "SHA256" => Ok(HashAlg::Sha256),
            "SHA384" => Ok(HashAlg::Sha384),
            "SHA512" => Ok(HashAlg::Sha512),
            other => Err(Error::unsupported("hash algorithm", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlg::Sha256 => "SHA256",
            HashAlg::Sha384 => "SHA384",
            HashAlg::Sha512 => "SHA512",
        }
    }
}

fn prf(alg: HashAlg, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC accepts keys of any size");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    }

    match alg {
        HashAlg::Sha256 => mac::<Hmac<Sha256>>(key, parts),
        HashAlg::Sha384 => mac::<Hmac<Sha384>>(key, parts),
        HashAlg::Sha512 => mac::<Hmac<Sha512>>(key, parts),
    }
}

/// SP800-108 KDF in counter mode.
///
/// The fixed input is `label || 0x00 || context || [L]_4` with `L` the output
/// size in bits, and the counter is a 32-bit big-endian value prefixed to
/// each PRF invocation. This matches the KDF Windows drives through
/// `BCryptKeyDerivation` for group keys.
pub fn kdf(alg: HashAlg, key: &[u8], label: &[u8], context: &[u8], length: usize) -> Vec<u8> {
    let l_bits = ((length as u32) * 8).to_be_bytes();
    let mut out = Vec::with_capacity(length);
    let mut counter: u32 = 1;
    while out.len() < length {
        let block = prf(
            alg,
            key,
            &[&counter.to_be_bytes(), label, &[0x00], context, &l_bits],
        );
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(length);
    out
}

/// SP800-56A concatenation KDF.
///
/// `otherinfo` is `algorithm_id || party_uinfo || party_vinfo`, the same
/// shape `BCryptDeriveKey` feeds it.
pub fn kdf_concat(
    alg: HashAlg,
    shared_secret: &[u8],
    algorithm_id: &[u8],
    party_uinfo: &[u8],
    party_vinfo: &[u8],
    length: usize,
) -> Vec<u8> {
    fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
        let mut digest = D::new();
        for part in parts {
            digest.update(part);
        }
        digest.finalize().to_vec()
    }

    let mut out = Vec::with_capacity(length);
    let mut counter: u32 = 1;
    while out.len() < length {
        let parts: [&[u8]; 5] = [
            &counter.to_be_bytes(),
            shared_secret,
            algorithm_id,
            party_uinfo,
            party_vinfo,
        ];
        let block = match alg {
            HashAlg::Sha256 => digest_parts::<Sha256>(&parts),
            HashAlg::Sha384 => digest_parts::<Sha384>(&parts),
            HashAlg::Sha512 => digest_parts::<Sha512>(&parts),
        };
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(length);
    out
}

/// The `msKds-KDFParam` structure naming the SP800-108 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParameters {
    pub hash_name: String,
}

impl KdfParameters {
    pub fn new(hash_name: &str) -> Self {
        Self {
            hash_name: hash_name.to_string(),
        }
    }

    pub fn hash_algorithm(&self) -> Result<HashAlg> {
        HashAlg::from_name(&self.hash_name)
    }

    pub fn pack(&self) -> Vec<u8> {
        let name = utf16_le_nul(&self.hash_name);
        let mut out = Vec::with_capacity(16 + name.len());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&[1, 0, 0, 0]);
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&name);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        if reader.take(4, "kdf parameters header")? != [0, 0, 0, 0] {
            return Err(Error::invalid("kdf parameters header", 0));
        }
        if reader.take(4, "kdf parameters count")? != [1, 0, 0, 0] {
            return Err(Error::invalid("kdf parameters count", 4));
        }
        let name_len = reader.u32_le("hash name length")? as usize;
        reader.take(4, "kdf parameters padding")?;
        let hash_name = reader.utf16_le(name_len, "hash name")?;
        Ok(Self { hash_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn kdf_is_deterministic_and_sized() {
        let key = [0x0b; 64];
        let label = service_label();
        let context = b"context bytes";
        for len in [16usize, 32, 64, 100] {
            let a = kdf(HashAlg::Sha512, &key, &label, context, len);
            let b = kdf(HashAlg::Sha512, &key, &label, context, len);
            assert_eq!(a, b);
            assert_eq!(a.len(), len);
        }
    }

    #[test]
    fn kdf_separates_contexts_and_hashes() {
        let key = [0x42; 64];
        let label = service_label();
        let a = kdf(HashAlg::Sha512, &key, &label, b"one", 32);
        let b = kdf(HashAlg::Sha512, &key, &label, b"two", 32);
        let c = kdf(HashAlg::Sha256, &key, &label, b"one", 32);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn concat_kdf_covers_multiple_blocks() {
        let shared = [0x7f; 256];
        let out = kdf_concat(HashAlg::Sha256, &shared, b"alg", b"u", b"v", 48);
        assert_eq!(out.len(), 48);
        let again = kdf_concat(HashAlg::Sha256, &shared, b"alg", b"u", b"v", 48);
        assert_eq!(out, again);
    }

    #[test]
    fn kdf_parameters_bytes() {
        let params = KdfParameters::new("SHA512");
        let packed = params.pack();
        assert_eq!(
            packed,
            hex!(
                "00000000" "01000000" "0e000000" "00000000"
                "53004800 41003500 31003200 0000"
            )
        );
        assert_eq!(KdfParameters::unpack(&packed).unwrap(), params);
    }

    #[test]
    fn unknown_hash_is_unsupported() {
        let params = KdfParameters::new("MD4");
        assert!(matches!(
            params.hash_algorithm(),
            Err(Error::Unsupported { .. })
        ));
    }
}
