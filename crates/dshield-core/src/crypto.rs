//! CEK and content encryption: AES-256 key wrap for the CEK, AES-256-GCM
//! for the payload, algorithm selection by OID as CMS carries it.

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_kw::KekAes256;
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence};
use rand::RngCore;

use crate::error::{Error, Result};

/// id-aes256-wrap, RFC 3394 key wrap.
pub const OID_AES256_WRAP: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.45");
/// id-aes256-GCM.
pub const OID_AES256_GCM: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.46");

/// RFC 5084 `GCMParameters`.
///
/// Windows writes the ICV length even though 12 is the schema default; the
/// decoder tolerates its absence and the value is not consulted on decrypt.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct GcmParameters {
    pub nonce: OctetString,
    #[asn1(default = "GcmParameters::default_icv_len")]
    pub icv_len: u8,
}

impl GcmParameters {
    fn default_icv_len() -> u8 {
        12
    }

    pub fn for_iv(iv: &[u8]) -> Result<Self> {
        Ok(Self {
            nonce: OctetString::new(iv.to_vec())?,
            icv_len: 16,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_der()?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::from_der(data)?)
    }
}

/// Draw a fresh 256-bit CEK and 96-bit GCM IV from the OS entropy source.
pub fn cek_generate() -> ([u8; 32], [u8; 12]) {
    let mut cek = [0u8; 32];
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut cek);
    rand::rngs::OsRng.fill_bytes(&mut iv);
    (cek, iv)
}

fn kek_cipher(kek: &[u8]) -> Result<KekAes256> {
    let key: [u8; 32] = kek
        .try_into()
        .map_err(|_| Error::KeyUnavailable("KEK is not 32 bytes"))?;
    Ok(KekAes256::from(key))
}

pub fn cek_encrypt(algorithm: &ObjectIdentifier, kek: &[u8], cek: &[u8]) -> Result<Vec<u8>> {
    if *algorithm != OID_AES256_WRAP {
        return Err(Error::unsupported(
            "cek encryption algorithm",
            algorithm.to_string(),
        ));
    }
    kek_cipher(kek)?
        .wrap_vec(cek)
        .map_err(|_| Error::DecryptionFailed("AES key wrap"))
}

pub fn cek_decrypt(algorithm: &ObjectIdentifier, kek: &[u8], enc_cek: &[u8]) -> Result<Vec<u8>> {
    if *algorithm != OID_AES256_WRAP {
        return Err(Error::unsupported(
            "cek encryption algorithm",
            algorithm.to_string(),
        ));
    }
    kek_cipher(kek)?
        .unwrap_vec(enc_cek)
        .map_err(|_| Error::DecryptionFailed("AES key unwrap integrity check"))
}

fn gcm_cipher(cek: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(cek).map_err(|_| Error::KeyUnavailable("CEK is not 32 bytes"))
}

fn gcm_iv(parameters: Option<&[u8]>) -> Result<Vec<u8>> {
    let parameters = parameters.ok_or(Error::invalid("content encryption parameters", 0))?;
    let params = GcmParameters::from_bytes(parameters)?;
    let iv = params.nonce.as_bytes();
    if iv.len() != 12 {
        return Err(Error::invalid("gcm nonce", 0));
    }
    Ok(iv.to_vec())
}

pub fn content_encrypt(
    algorithm: &ObjectIdentifier,
    parameters: Option<&[u8]>,
    cek: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if *algorithm != OID_AES256_GCM {
        return Err(Error::unsupported(
            "content encryption algorithm",
            algorithm.to_string(),
        ));
    }
    let iv = gcm_iv(parameters)?;
    gcm_cipher(cek)?
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::DecryptionFailed("AES-GCM seal"))
}

pub fn content_decrypt(
    algorithm: &ObjectIdentifier,
    parameters: Option<&[u8]>,
    cek: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if *algorithm != OID_AES256_GCM {
        return Err(Error::unsupported(
            "content encryption algorithm",
            algorithm.to_string(),
        ));
    }
    let iv = gcm_iv(parameters)?;
    gcm_cipher(cek)?
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| Error::DecryptionFailed("AES-GCM tag check"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cek_wrap_roundtrip_and_tamper() {
        let kek = [7u8; 32];
        let cek = [3u8; 32];
        let wrapped = cek_encrypt(&OID_AES256_WRAP, &kek, &cek).unwrap();
        assert_eq!(wrapped.len(), 40);
        assert_eq!(cek_decrypt(&OID_AES256_WRAP, &kek, &wrapped).unwrap(), cek);

        let mut bad = wrapped.clone();
        bad[0] ^= 0x80;
        assert!(matches!(
            cek_decrypt(&OID_AES256_WRAP, &kek, &bad),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn content_roundtrip_and_tag_flip() {
        let (cek, iv) = cek_generate();
        let params = GcmParameters::for_iv(&iv).unwrap().to_bytes().unwrap();
        let pt = b"hello dpapi-ng";
        let ct = content_encrypt(&OID_AES256_GCM, Some(&params), &cek, pt).unwrap();
        assert_eq!(
            content_decrypt(&OID_AES256_GCM, Some(&params), &cek, &ct).unwrap(),
            pt
        );

        let mut bad = ct.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(
            content_decrypt(&OID_AES256_GCM, Some(&params), &cek, &bad),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn gcm_parameters_default_icv_len() {
        let params = GcmParameters::for_iv(&[9u8; 12]).unwrap();
        let packed = params.to_bytes().unwrap();
        let parsed = GcmParameters::from_bytes(&packed).unwrap();
        assert_eq!(parsed.icv_len, 16);

        // SEQUENCE { OCTET STRING iv } with the ICV length omitted.
        let mut short = vec![0x30, 14, 0x04, 12];
        short.extend_from_slice(&[9u8; 12]);
        let parsed = GcmParameters::from_bytes(&short).unwrap();
        assert_eq!(parsed.icv_len, 12);
        assert_eq!(parsed.nonce.as_bytes(), &[9u8; 12]);
    }

    #[test]
    fn unknown_algorithm_oids_are_unsupported() {
        let oid = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.2");
        assert!(matches!(
            cek_encrypt(&oid, &[0u8; 32], &[0u8; 32]),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            content_decrypt(&oid, None, &[0u8; 32], b""),
            Err(Error::Unsupported { .. })
        ));
    }
}
