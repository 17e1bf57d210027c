//! The pure halves of protect/unprotect: everything between "we have a
//! group key envelope" and "here are the blob bytes / the plaintext".

use zeroize::Zeroize;

use crate::blob::DpapiNgBlob;
use crate::crypto::{self, GcmParameters, OID_AES256_GCM, OID_AES256_WRAP};
use crate::error::Result;
use crate::gkdi::GroupKeyEnvelope;

/// Decrypt an unpacked blob with the envelope that covers its key
/// identifier: derive the KEK, unwrap the CEK, open the content.
pub fn decrypt_blob(blob: &DpapiNgBlob, key: &GroupKeyEnvelope) -> Result<Vec<u8>> {
    let mut kek = key.get_kek(&blob.key_identifier, &blob.security_descriptor)?;
    let cek = crypto::cek_decrypt(&blob.enc_cek_algorithm, &kek, &blob.enc_cek);
    kek.zeroize();
    let mut cek = cek?;

    let plaintext = crypto::content_decrypt(
        &blob.enc_content_algorithm,
        blob.enc_content_parameters.as_deref(),
        &cek,
        &blob.enc_content,
    );
    cek.zeroize();
    plaintext
}

/// Encrypt `data` under a fresh CEK wrapped for `key`, producing an
/// envelope-mode blob bound to `security_descriptor`.
pub fn encrypt_blob(
    data: &[u8],
    key: &GroupKeyEnvelope,
    security_descriptor: Vec<u8>,
) -> Result<Vec<u8>> {
    let (mut cek, iv) = crypto::cek_generate();
    let enc_content_parameters = GcmParameters::for_iv(&iv)?.to_bytes()?;
    let enc_content = crypto::content_encrypt(
        &OID_AES256_GCM,
        Some(&enc_content_parameters),
        &cek,
        data,
    )?;

    let (mut kek, key_identifier) = key.new_kek(&security_descriptor)?;
    let enc_cek = crypto::cek_encrypt(&OID_AES256_WRAP, &kek, &cek);
    kek.zeroize();
    cek.zeroize();
    let enc_cek = enc_cek?;

    DpapiNgBlob {
        key_identifier,
        security_descriptor,
        enc_cek,
        enc_cek_algorithm: OID_AES256_WRAP,
        enc_cek_parameters: None,
        enc_content,
        enc_content_algorithm: OID_AES256_GCM,
        enc_content_parameters: Some(enc_content_parameters),
    }
    .pack(true)
}
