//! Pure protect/unprotect composition against a locally synthesised seed.

use uuid::Uuid;

use dshield_core::{
    decrypt_blob, encrypt_blob, sd, DpapiNgBlob, Error, KeyCache, RootKey,
};

fn root_key_id() -> Uuid {
    Uuid::from_u128(0xd71e4b2c_88a0_4f10_9c7e_3030f5ad6b01)
}

fn seeded_cache() -> KeyCache {
    let cache = KeyCache::new();
    cache.load_key(root_key_id(), RootKey::new(vec![0u8; 64]));
    cache
}

#[test]
fn encrypt_then_decrypt_recovers_plaintext() {
    let cache = seeded_cache();
    let sd = sd::build_target_descriptor("S-1-5-21-4-5-6-1105").unwrap();
    let key = cache
        .get(&sd, root_key_id(), 361, 0, 0)
        .unwrap()
        .expect("seed from loaded root key");

    let packed = encrypt_blob(b"hello", &key, sd.clone()).unwrap();
    let blob = DpapiNgBlob::unpack(&packed).unwrap();
    assert_eq!(blob.security_descriptor, sd);
    assert_eq!(blob.key_identifier.root_key_id, root_key_id());
    assert!(!blob.key_identifier.is_public_key());

    assert_eq!(decrypt_blob(&blob, &key).unwrap(), b"hello");
}

#[test]
fn fresh_cek_per_blob() {
    let cache = seeded_cache();
    let sd = sd::build_target_descriptor("S-1-5-21-4-5-6-1105").unwrap();
    let key = cache.get(&sd, root_key_id(), 361, 0, 0).unwrap().unwrap();

    let a = DpapiNgBlob::unpack(&encrypt_blob(b"same", &key, sd.clone()).unwrap()).unwrap();
    let b = DpapiNgBlob::unpack(&encrypt_blob(b"same", &key, sd).unwrap()).unwrap();
    assert_ne!(a.enc_cek, b.enc_cek);
    assert_ne!(a.enc_content, b.enc_content);
    assert_ne!(a.key_identifier.key_info, b.key_identifier.key_info);
}

#[test]
fn flipped_ciphertext_bit_fails_closed() {
    let cache = seeded_cache();
    let sd = sd::build_target_descriptor("S-1-5-21-4-5-6-1105").unwrap();
    let key = cache.get(&sd, root_key_id(), 361, 0, 0).unwrap().unwrap();

    let packed = encrypt_blob(&[0x5au8; 1024], &key, sd).unwrap();
    let mut blob = DpapiNgBlob::unpack(&packed).unwrap();
    let last = blob.enc_content.len() - 1;
    blob.enc_content[last] ^= 0x01;
    assert!(matches!(
        decrypt_blob(&blob, &key),
        Err(Error::DecryptionFailed(_))
    ));
}

#[test]
fn tampered_wrapped_cek_fails_closed() {
    let cache = seeded_cache();
    let sd = sd::build_target_descriptor("S-1-5-21-4-5-6-1105").unwrap();
    let key = cache.get(&sd, root_key_id(), 361, 0, 0).unwrap().unwrap();

    let packed = encrypt_blob(b"secret", &key, sd).unwrap();
    let mut blob = DpapiNgBlob::unpack(&packed).unwrap();
    blob.enc_cek[0] ^= 0x80;
    assert!(matches!(
        decrypt_blob(&blob, &key),
        Err(Error::DecryptionFailed(_))
    ));
}

#[test]
fn appended_mode_preserves_content() {
    let cache = seeded_cache();
    let sd = sd::build_target_descriptor("S-1-5-21-4-5-6-1105").unwrap();
    let key = cache.get(&sd, root_key_id(), 361, 0, 0).unwrap().unwrap();

    let packed = encrypt_blob(b"laps style", &key, sd).unwrap();
    let blob = DpapiNgBlob::unpack(&packed).unwrap();
    let appended = blob.pack(false).unwrap();
    assert_ne!(appended, packed);

    let reparsed = DpapiNgBlob::unpack(&appended).unwrap();
    assert_eq!(reparsed, blob);
    assert_eq!(decrypt_blob(&reparsed, &key).unwrap(), b"laps style");
}
