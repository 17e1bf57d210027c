//! Seed-tree walk and KEK derivation properties.

use num_bigint::BigUint;
use uuid::Uuid;

use dshield_core::gkdi::{
    compute_l1_key, compute_l2_key, FfcdhKey, FfcdhParameters, GroupKeyEnvelope, RootKey,
    MAX_INDEX, SEED_KEY_LEN,
};
use dshield_core::kdf::{kdf, HashAlg, KdfParameters};
use dshield_core::{Error, KeyIdentifier};

fn utf16_nul(value: &str) -> Vec<u8> {
    value
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn root_key_id() -> Uuid {
    Uuid::from_u128(0x2f4a9c6e_0d1b_4f72_9e35_8cc011bb55aa)
}

fn target_sd() -> Vec<u8> {
    dshield_core::sd::build_target_descriptor("S-1-5-21-1-2-3-1105").unwrap()
}

fn seed_envelope(target_sd: &[u8]) -> GroupKeyEnvelope {
    let root_key = RootKey::new(vec![0x4d; 64]);
    let l1_key = compute_l1_key(target_sd, root_key_id(), 123, &root_key.key, HashAlg::Sha512);
    GroupKeyEnvelope {
        version: 1,
        flags: 2,
        l0: 123,
        l1: MAX_INDEX,
        l2: MAX_INDEX,
        root_key_id: root_key_id(),
        kdf_algorithm: "SP800_108_CTR_HMAC".to_string(),
        kdf_parameters: KdfParameters::new("SHA512").pack(),
        secret_algorithm: "DH".to_string(),
        secret_parameters: FfcdhParameters::modp_2048().pack(),
        private_key_length: 512,
        public_key_length: 2048,
        domain_name: "shield.test".to_string(),
        forest_name: "shield.test".to_string(),
        l1_key,
        l2_key: Vec::new(),
    }
}

#[test]
fn l2_walk_is_deterministic() {
    let sd = target_sd();
    let envelope = seed_envelope(&sd);
    let a = compute_l2_key(HashAlg::Sha512, &sd, 5, 1, &envelope).unwrap();
    let b = compute_l2_key(HashAlg::Sha512, &sd, 5, 1, &envelope).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), SEED_KEY_LEN);
}

#[test]
fn l2_walk_composes_across_intermediate_seeds() {
    let sd = target_sd();
    let envelope = seed_envelope(&sd);
    let direct = compute_l2_key(HashAlg::Sha512, &sd, 5, 1, &envelope).unwrap();

    let mid = compute_l2_key(HashAlg::Sha512, &sd, 5, 3, &envelope).unwrap();
    let mut refined = envelope.clone();
    refined.l1 = 5;
    refined.l2 = 3;
    refined.l1_key = Vec::new();
    refined.l2_key = mid;

    let via = compute_l2_key(HashAlg::Sha512, &sd, 5, 1, &refined).unwrap();
    assert_eq!(direct, via);
}

#[test]
fn every_walk_step_binds_the_target_descriptor() {
    let sd_a = target_sd();
    let sd_b = dshield_core::sd::build_target_descriptor("S-1-5-21-1-2-3-1106").unwrap();
    // One envelope, two descriptors: the chains must diverge even though the
    // starting seed material is byte-identical.
    let envelope = seed_envelope(&sd_a);

    // Pure L2 descent within the envelope's own L1.
    let l2_a = compute_l2_key(HashAlg::Sha512, &sd_a, MAX_INDEX, 7, &envelope).unwrap();
    let l2_b = compute_l2_key(HashAlg::Sha512, &sd_b, MAX_INDEX, 7, &envelope).unwrap();
    assert_ne!(l2_a, l2_b);

    // L1 descent steps as well.
    let l1_a = compute_l2_key(HashAlg::Sha512, &sd_a, 5, MAX_INDEX, &envelope).unwrap();
    let l1_b = compute_l2_key(HashAlg::Sha512, &sd_b, 5, MAX_INDEX, &envelope).unwrap();
    assert_ne!(l1_a, l1_b);
}

#[test]
fn walk_refuses_non_dominated_requests() {
    let sd = target_sd();
    let mut envelope = seed_envelope(&sd);
    envelope.l1 = 5;
    envelope.l2 = 3;
    envelope.l2_key = vec![0x33; SEED_KEY_LEN];
    envelope.l1_key = Vec::new();

    for (l1, l2) in [(6, 0), (5, 4), (31, 31)] {
        assert!(matches!(
            compute_l2_key(HashAlg::Sha512, &sd, l1, l2, &envelope),
            Err(Error::KeyUnavailable(_))
        ));
    }
    // The exact position is still reachable.
    assert!(compute_l2_key(HashAlg::Sha512, &sd, 5, 3, &envelope).is_ok());
}

#[test]
fn symmetric_kek_roundtrip() {
    let sd = target_sd();
    let envelope = seed_envelope(&sd);
    let (kek, key_id) = envelope.new_kek(&sd).unwrap();
    assert_eq!(kek.len(), 32);
    assert!(!key_id.is_public_key());
    assert_eq!(key_id.key_info.len(), 32);
    assert_eq!(
        (key_id.l0, key_id.l1, key_id.l2),
        (envelope.l0, envelope.l1, envelope.l2)
    );

    let again = envelope.get_kek(&key_id, &sd).unwrap();
    assert_eq!(kek, again);
}

#[test]
fn dh_kek_agreement_between_protector_and_unprotector() {
    let sd = target_sd();
    let envelope = seed_envelope(&sd);
    let alg = HashAlg::Sha512;
    let params = FfcdhParameters::modp_2048();

    // A DC that withholds the seed publishes g^x where x is derived from
    // the L2 seed, so authorised readers can recompute it.
    let (l1, l2) = (2, 5);
    let l2_seed = compute_l2_key(alg, &sd, l1, l2, &envelope).unwrap();
    let server_private = kdf(alg, &l2_seed, &utf16_nul("KDS service"), &utf16_nul("DH"), 64);
    let server_public = params
        .generator
        .modpow(&BigUint::from_bytes_be(&server_private), &params.field_order);

    let mut public_envelope = envelope.clone();
    public_envelope.flags |= 1;
    public_envelope.l1 = l1;
    public_envelope.l2 = l2;
    public_envelope.l1_key = Vec::new();
    public_envelope.l2_key = FfcdhKey {
        key_length: params.key_length,
        field_order: params.field_order.clone(),
        generator: params.generator.clone(),
        public_key: server_public,
    }
    .pack();

    let (protect_kek, key_id) = public_envelope.new_kek(&sd).unwrap();
    assert!(key_id.is_public_key());

    let unprotect_kek = envelope.get_kek(&key_id, &sd).unwrap();
    assert_eq!(protect_kek, unprotect_kek);
}

#[test]
fn public_envelope_cannot_serve_get_kek() {
    let sd = target_sd();
    let mut envelope = seed_envelope(&sd);
    envelope.flags |= 1;
    let key_id = KeyIdentifier {
        version: 1,
        flags: 0,
        l0: envelope.l0,
        l1: 0,
        l2: 0,
        root_key_id: envelope.root_key_id,
        key_info: vec![0u8; 32],
        domain_name: String::new(),
        forest_name: String::new(),
    };
    assert!(matches!(
        envelope.get_kek(&key_id, &sd),
        Err(Error::KeyUnavailable(_))
    ));
}

#[test]
fn envelope_roundtrip() {
    let envelope = seed_envelope(&target_sd());
    let packed = envelope.pack();
    assert_eq!(GroupKeyEnvelope::unpack(&packed).unwrap(), envelope);
}

#[test]
fn envelope_rejects_bad_magic_and_missing_seeds() {
    let envelope = seed_envelope(&target_sd());
    let mut packed = envelope.pack();
    packed[4] ^= 0xff;
    assert!(matches!(
        GroupKeyEnvelope::unpack(&packed),
        Err(Error::InvalidFormat { .. })
    ));

    let mut empty = envelope;
    empty.l1_key = Vec::new();
    empty.l2_key = Vec::new();
    assert!(GroupKeyEnvelope::unpack(&empty.pack()).is_err());
}

#[test]
fn l1_derivation_depends_on_target_descriptor() {
    let root_key = RootKey::new(vec![0x4d; 64]);
    let sd_a = dshield_core::sd::build_target_descriptor("S-1-5-21-1-2-3-1105").unwrap();
    let sd_b = dshield_core::sd::build_target_descriptor("S-1-5-21-1-2-3-1106").unwrap();
    let a = compute_l1_key(&sd_a, root_key_id(), 7, &root_key.key, HashAlg::Sha512);
    let b = compute_l1_key(&sd_b, root_key_id(), 7, &root_key.key, HashAlg::Sha512);
    assert_ne!(a, b);
    assert_eq!(a.len(), SEED_KEY_LEN);
}
