//! MS-GKDI group key derivation: the L0/L1/L2 seed hierarchy, the group key
//! envelope and root key structures, and KEK computation for both the
//! symmetric and the FFC-DH exchange paths.

use hex_literal::hex;
use num_bigint::BigUint;
use rand::RngCore;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::kdf::{self, HashAlg, KdfParameters};
use crate::key_id::KeyIdentifier;
use crate::wire::{utf16_le_nul, ByteReader};

/// KDF algorithm name stored on `msKds-ProvRootKey` objects.
pub const KDF_SP800_108_CTR_HMAC: &str = "SP800_108_CTR_HMAC";
/// Secret agreement algorithm name for finite-field Diffie-Hellman.
pub const SECRET_AGREEMENT_DH: &str = "DH";

/// Seed keys are 512 bits throughout the hierarchy.
pub const SEED_KEY_LEN: usize = 64;
/// Highest L1/L2 index; the ratchet walks down from here.
pub const MAX_INDEX: i32 = 31;

const ENVELOPE_MAGIC: [u8; 4] = *b"KDSK";
const DH_PARAMETERS_MAGIC: [u8; 4] = *b"DHPM";
const DH_PUBLIC_KEY_MAGIC: [u8; 4] = *b"DHPB";

/// RFC 5114 2.3, the 2048-bit MODP group with 256-bit prime order subgroup
/// that `msKds-SecretAgreementParam` defaults to.
pub const MODP_2048_KEY_LENGTH: u32 = 256;
pub const MODP_2048_P: [u8; 256] = hex!(
    "87A8E61DB4B6663CFFBBD19C651959998CEEF608660DD0F25D2CEED4435E3B00"
    "E00DF8F1D61957D4FAF7DF4561B2AA3016C3D91134096FAA3BF4296D830E9A7C"
    "209E0C6497517ABD5A8A9D306BCF67ED91F9E6725B4758C022E0B1EF4275BF7B"
    "6C5BFC11D45F9088B941F54EB1E59BB8BC39A0BF12307F5C4FDB70C581B23F76"
    "B63ACAE1CAA6B7902D52526735488A0EF13C6D9A51BFA4AB3AD8347796524D8E"
    "F6A167B5A41825D967E144E5140564251CCACB83E6B486F6B3CA3F7971506026"
    "C0B857F689962856DED4010ABD0BE621C3A3960A54E710C375F26375D7014103"
    "A4B54330C198AF126116D2276E11715F693877FAD7EF09CADB094AE91E1A1597"
);
pub const MODP_2048_G: [u8; 256] = hex!(
    "3FB32C9B73134D0B2E77506660EDBD484CA7B18F21EF205407F4793A1A0BA125"
    "10DBC15077BE463FFF4FED4AAC0BB555BE3A6C1B0C6B47B1BC3773BF7E8C6F62"
    "901228F8C28CBB18A55AE31341000A650196F931C77A57F2DDF463E5E9EC144B"
    "777DE62AAAB8A8628AC376D282D6ED3864E67982428EBC831D14348F6F2F9193"
    "B5045AF2767164E1DFC967C1FB3F2E55A4BD1BFFE83B9C80D052B985D182EA0A"
    "DB2A3B7313D3FE14C8484B1E052588B9B7D2BBD2DF016199ECD06E1557CD0915"
    "B3353BBB64E0EC377FD028370DF92B52C7891428CDC67EB6184B523D1DB246C3"
    "2F63078490F00EF8D647D148D47954515E2327CFEF98C582664B4C0F6CC41659"
);

fn to_padded_be(value: &BigUint, len: usize) -> Result<Vec<u8>> {
    let bytes = value.to_bytes_be();
    if bytes.len() > len {
        return Err(Error::invalid("field element width", 0));
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// `msKds-SecretAgreementParam`: a BCRYPT_DH_PARAMETER_HEADER blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfcdhParameters {
    pub key_length: u32,
    pub field_order: BigUint,
    pub generator: BigUint,
}

impl FfcdhParameters {
    /// The RFC 5114 2.3 group Windows provisions by default.
    pub fn modp_2048() -> Self {
        Self {
            key_length: MODP_2048_KEY_LENGTH,
            field_order: BigUint::from_bytes_be(&MODP_2048_P),
            generator: BigUint::from_bytes_be(&MODP_2048_G),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let len = self.key_length as usize;
        let p = to_padded_be(&self.field_order, len).expect("field order fits key length");
        let g = to_padded_be(&self.generator, len).expect("generator fits key length");

        let mut out = Vec::with_capacity(12 + 2 * len);
        out.extend_from_slice(&((12 + 2 * len) as u32).to_le_bytes());
        out.extend_from_slice(&DH_PARAMETERS_MAGIC);
        out.extend_from_slice(&self.key_length.to_le_bytes());
        out.extend_from_slice(&p);
        out.extend_from_slice(&g);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let total = reader.u32_le("dh parameters length")? as usize;
        if reader.take(4, "dh parameters magic")? != DH_PARAMETERS_MAGIC {
            return Err(Error::invalid("dh parameters magic", 4));
        }
        let key_length = reader.u32_le("dh key length")? as usize;
        if total != 12 + 2 * key_length {
            return Err(Error::invalid("dh parameters length", 0));
        }
        let field_order = BigUint::from_bytes_be(reader.take(key_length, "dh field order")?);
        let generator = BigUint::from_bytes_be(reader.take(key_length, "dh generator")?);
        Ok(Self {
            key_length: key_length as u32,
            field_order,
            generator,
        })
    }
}

/// A BCRYPT_DH_PUBLIC_BLOB: group parameters plus one public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfcdhKey {
    pub key_length: u32,
    pub field_order: BigUint,
    pub generator: BigUint,
    pub public_key: BigUint,
}

impl FfcdhKey {
    pub fn pack(&self) -> Vec<u8> {
        let len = self.key_length as usize;
        let p = to_padded_be(&self.field_order, len).expect("field order fits key length");
        let g = to_padded_be(&self.generator, len).expect("generator fits key length");
        let y = to_padded_be(&self.public_key, len).expect("public key fits key length");

        let mut out = Vec::with_capacity(8 + 3 * len);
        out.extend_from_slice(&DH_PUBLIC_KEY_MAGIC);
        out.extend_from_slice(&self.key_length.to_le_bytes());
        out.extend_from_slice(&p);
        out.extend_from_slice(&g);
        out.extend_from_slice(&y);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        if reader.take(4, "dh public key magic")? != DH_PUBLIC_KEY_MAGIC {
            return Err(Error::invalid("dh public key magic", 0));
        }
        let key_length = reader.u32_le("dh key length")? as usize;
        let field_order = BigUint::from_bytes_be(reader.take(key_length, "dh field order")?);
        let generator = BigUint::from_bytes_be(reader.take(key_length, "dh generator")?);
        let public_key = BigUint::from_bytes_be(reader.take(key_length, "dh public key")?);
        Ok(Self {
            key_length: key_length as u32,
            field_order,
            generator,
            public_key,
        })
    }
}

/// The `msKds-ProvRootKey` material a domain controller derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootKey {
    /// The 64-byte `msKds-RootKeyData` value.
    pub key: Vec<u8>,
    pub version: u32,
    pub kdf_algorithm: String,
    pub kdf_parameters: Vec<u8>,
    pub secret_algorithm: String,
    pub secret_parameters: Vec<u8>,
    pub private_key_length: u32,
    pub public_key_length: u32,
}

impl RootKey {
    /// Wrap root key material with the directory's default metadata:
    /// SP800-108 CTR-HMAC over SHA-512 and the RFC 5114 2.3 DH group.
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            version: 1,
            kdf_algorithm: KDF_SP800_108_CTR_HMAC.to_string(),
            kdf_parameters: KdfParameters::new("SHA512").pack(),
            secret_algorithm: SECRET_AGREEMENT_DH.to_string(),
            secret_parameters: FfcdhParameters::modp_2048().pack(),
            private_key_length: 512,
            public_key_length: 2048,
        }
    }

    pub fn hash_algorithm(&self) -> Result<HashAlg> {
        if self.kdf_algorithm != KDF_SP800_108_CTR_HMAC {
            return Err(Error::unsupported("kdf algorithm", &*self.kdf_algorithm));
        }
        KdfParameters::unpack(&self.kdf_parameters)?.hash_algorithm()
    }
}

/// A possibly partial node of the seed tree as MS-GKDI `GetKey` returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeyEnvelope {
    pub version: u32,
    /// Bit 0: `l2_key` is an agreement public key. Bit 1: `l2_key` is
    /// authoritative for (l0, l1, l2).
    pub flags: u32,
    pub l0: i32,
    pub l1: i32,
    pub l2: i32,
    pub root_key_id: Uuid,
    pub kdf_algorithm: String,
    pub kdf_parameters: Vec<u8>,
    pub secret_algorithm: String,
    pub secret_parameters: Vec<u8>,
    pub private_key_length: u32,
    pub public_key_length: u32,
    pub domain_name: String,
    pub forest_name: String,
    pub l1_key: Vec<u8>,
    pub l2_key: Vec<u8>,
}

impl GroupKeyEnvelope {
    /// Whether the envelope carries a one-shot agreement public key instead
    /// of seed material. Such envelopes must never enter the cache.
    pub fn is_public_key(&self) -> bool {
        self.flags & 1 != 0
    }

    pub fn hash_algorithm(&self) -> Result<HashAlg> {
        if self.kdf_algorithm != KDF_SP800_108_CTR_HMAC {
            return Err(Error::unsupported("kdf algorithm", &*self.kdf_algorithm));
        }
        KdfParameters::unpack(&self.kdf_parameters)?.hash_algorithm()
    }

    pub fn pack(&self) -> Vec<u8> {
        let kdf_algorithm = utf16_le_nul(&self.kdf_algorithm);
        let secret_algorithm = utf16_le_nul(&self.secret_algorithm);
        let domain = utf16_le_nul(&self.domain_name);
        let forest = utf16_le_nul(&self.forest_name);

        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.l0.to_le_bytes());
        out.extend_from_slice(&self.l1.to_le_bytes());
        out.extend_from_slice(&self.l2.to_le_bytes());
        out.extend_from_slice(&self.root_key_id.to_bytes_le());
        out.extend_from_slice(&(kdf_algorithm.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.kdf_parameters.len() as u32).to_le_bytes());
        out.extend_from_slice(&(secret_algorithm.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.secret_parameters.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.private_key_length.to_le_bytes());
        out.extend_from_slice(&self.public_key_length.to_le_bytes());
        out.extend_from_slice(&(self.l1_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.l2_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(domain.len() as u32).to_le_bytes());
        out.extend_from_slice(&(forest.len() as u32).to_le_bytes());
        out.extend_from_slice(&kdf_algorithm);
        out.extend_from_slice(&self.kdf_parameters);
        out.extend_from_slice(&secret_algorithm);
        out.extend_from_slice(&self.secret_parameters);
        out.extend_from_slice(&domain);
        out.extend_from_slice(&forest);
        out.extend_from_slice(&self.l1_key);
        out.extend_from_slice(&self.l2_key);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let version = reader.u32_le("version")?;
        if reader.take(4, "magic")? != ENVELOPE_MAGIC {
            return Err(Error::invalid("magic", 4));
        }
        let flags = reader.u32_le("flags")?;
        let l0 = reader.i32_le("l0")?;
        let l1 = reader.i32_le("l1")?;
        let l2 = reader.i32_le("l2")?;
        let root_key_id = reader.uuid_le("root key id")?;
        let kdf_algorithm_len = reader.u32_le("kdf algorithm length")? as usize;
        let kdf_parameters_len = reader.u32_le("kdf parameters length")? as usize;
        let secret_algorithm_len = reader.u32_le("secret algorithm length")? as usize;
        let secret_parameters_len = reader.u32_le("secret parameters length")? as usize;
        let private_key_length = reader.u32_le("private key length")?;
        let public_key_length = reader.u32_le("public key length")?;
        let l1_key_len = reader.u32_le("l1 key length")? as usize;
        let l2_key_len = reader.u32_le("l2 key length")? as usize;
        let domain_len = reader.u32_le("domain length")? as usize;
        let forest_len = reader.u32_le("forest length")? as usize;

        let kdf_algorithm = reader.utf16_le(kdf_algorithm_len, "kdf algorithm")?;
        let kdf_parameters = reader.take(kdf_parameters_len, "kdf parameters")?.to_vec();
        let secret_algorithm = reader.utf16_le(secret_algorithm_len, "secret algorithm")?;
        let secret_parameters = reader
            .take(secret_parameters_len, "secret parameters")?
            .to_vec();
        let domain_name = reader.utf16_le(domain_len, "domain name")?;
        let forest_name = reader.utf16_le(forest_len, "forest name")?;
        let l1_key = reader.take(l1_key_len, "l1 key")?.to_vec();
        let l2_key = reader.take(l2_key_len, "l2 key")?.to_vec();

        if l1_key.is_empty() && l2_key.is_empty() {
            return Err(Error::invalid("seed keys", reader.position()));
        }

        Ok(Self {
            version,
            flags,
            l0,
            l1,
            l2,
            root_key_id,
            kdf_algorithm,
            kdf_parameters,
            secret_algorithm,
            secret_parameters,
            private_key_length,
            public_key_length,
            domain_name,
            forest_name,
            l1_key,
            l2_key,
        })
    }

    /// Derive the KEK a blob carrying `key_id` was wrapped under, for the
    /// target security descriptor the blob is bound to.
    pub fn get_kek(&self, key_id: &KeyIdentifier, target_sd: &[u8]) -> Result<Vec<u8>> {
        if self.is_public_key() {
            return Err(Error::KeyUnavailable(
                "server withheld the seed and returned a public key envelope",
            ));
        }
        let alg = self.hash_algorithm()?;
        let label = kdf::service_label();
        let mut l2_key = compute_l2_key(alg, target_sd, key_id.l1, key_id.l2, self)?;

        let kek = if key_id.is_public_key() {
            // The protecting side ran an ephemeral exchange; our half of the
            // agreement key is derived from the seed, never stored.
            let mut private_key = kdf::kdf(
                alg,
                &l2_key,
                &label,
                &utf16_le_nul(&self.secret_algorithm),
                self.private_key_length.div_ceil(8) as usize,
            );
            let kek = agree_kek(&self.secret_algorithm, &private_key, &key_id.key_info);
            private_key.zeroize();
            kek?
        } else {
            kdf::kdf(alg, &l2_key, &label, &key_id.key_info, 32)
        };
        l2_key.zeroize();
        Ok(kek)
    }

    /// Derive a fresh KEK for protecting new content bound to `target_sd`,
    /// together with the key identifier to stamp into the blob.
    pub fn new_kek(&self, target_sd: &[u8]) -> Result<(Vec<u8>, KeyIdentifier)> {
        let alg = self.hash_algorithm()?;
        let label = kdf::service_label();

        let (kek, flags, key_info) = if self.is_public_key() {
            // The envelope carries the server's agreement key; generate our
            // ephemeral half and publish its public blob in the identifier.
            if self.secret_algorithm != SECRET_AGREEMENT_DH {
                return Err(Error::unsupported(
                    "secret agreement algorithm",
                    &*self.secret_algorithm,
                ));
            }
            let peer = FfcdhKey::unpack(&self.l2_key)?;
            let mut private_bytes = vec![0u8; self.private_key_length.div_ceil(8) as usize];
            rand::rngs::OsRng.fill_bytes(&mut private_bytes);
            let private = BigUint::from_bytes_be(&private_bytes);
            private_bytes.zeroize();

            let public = peer.generator.modpow(&private, &peer.field_order);
            let shared = peer.public_key.modpow(&private, &peer.field_order);
            let mut shared_bytes = to_padded_be(&shared, peer.key_length as usize)?;
            let kek = kek_from_shared_secret(&shared_bytes);
            shared_bytes.zeroize();

            let ours = FfcdhKey {
                key_length: peer.key_length,
                field_order: peer.field_order.clone(),
                generator: peer.generator.clone(),
                public_key: public,
            };
            (kek, self.flags | 1, ours.pack())
        } else {
            let mut key_info = vec![0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key_info);
            let mut l2_key = compute_l2_key(alg, target_sd, self.l1, self.l2, self)?;
            let kek = kdf::kdf(alg, &l2_key, &label, &key_info, 32);
            l2_key.zeroize();
            (kek, self.flags & !1, key_info)
        };

        let key_identifier = KeyIdentifier {
            version: 1,
            flags,
            l0: self.l0,
            l1: self.l1,
            l2: self.l2,
            root_key_id: self.root_key_id,
            key_info,
            domain_name: self.domain_name.clone(),
            forest_name: self.forest_name.clone(),
        };
        Ok((kek, key_identifier))
    }
}

/// Context for every step of the seed hierarchy: the target security
/// descriptor brackets the key identifier triple, so no two descriptors
/// ever share a chain value. `-1` marks a level not yet descended.
fn seed_context(target_sd: &[u8], root_key_id: Uuid, l0: i32, l1: i32, l2: i32) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(2 * target_sd.len() + 28);
    ctx.extend_from_slice(target_sd);
    ctx.extend_from_slice(&root_key_id.to_bytes_le());
    ctx.extend_from_slice(&l0.to_le_bytes());
    ctx.extend_from_slice(&l1.to_le_bytes());
    ctx.extend_from_slice(&l2.to_le_bytes());
    ctx.extend_from_slice(target_sd);
    ctx
}

/// Derive the L1 = 31 seed for `l0` from root key material.
///
/// Two KDF steps: root key to the L0 seed, then the L0 seed to the first L1
/// key, both bound to the target security descriptor.
pub fn compute_l1_key(
    target_sd: &[u8],
    root_key_id: Uuid,
    l0: i32,
    root_key: &[u8],
    alg: HashAlg,
) -> Vec<u8> {
    let label = kdf::service_label();
    let mut l0_seed = kdf::kdf(
        alg,
        root_key,
        &label,
        &seed_context(target_sd, root_key_id, l0, -1, -1),
        SEED_KEY_LEN,
    );

    let l1 = kdf::kdf(
        alg,
        &l0_seed,
        &label,
        &seed_context(target_sd, root_key_id, l0, MAX_INDEX, -1),
        SEED_KEY_LEN,
    );
    l0_seed.zeroize();
    l1
}

/// Walk the ratchet from `envelope` down to `(request_l1, request_l2)`,
/// mixing `target_sd` into the context of every step.
///
/// The walk is strictly monotone; a request the envelope does not dominate
/// is refused rather than walked backwards.
pub fn compute_l2_key(
    alg: HashAlg,
    target_sd: &[u8],
    request_l1: i32,
    request_l2: i32,
    envelope: &GroupKeyEnvelope,
) -> Result<Vec<u8>> {
    if !(envelope.l1 > request_l1 || (envelope.l1 == request_l1 && envelope.l2 >= request_l2)) {
        return Err(Error::KeyUnavailable(
            "seed does not dominate the requested key interval",
        ));
    }

    let label = kdf::service_label();
    let mut l1 = envelope.l1;
    let mut l1_key = envelope.l1_key.clone();
    let mut l2 = envelope.l2;
    let mut l2_key = envelope.l2_key.clone();
    let mut reseed_l2 = l2_key.is_empty() || l1 != request_l1;

    // When the L2 chain has moved off 31 the envelope's L1 key belongs to
    // the previous L1 index.
    if l2 != MAX_INDEX && l1 != request_l1 {
        l1 -= 1;
    }

    while l1 != request_l1 {
        reseed_l2 = true;
        l1 -= 1;
        let next = kdf::kdf(
            alg,
            &l1_key,
            &label,
            &seed_context(target_sd, envelope.root_key_id, envelope.l0, l1, -1),
            SEED_KEY_LEN,
        );
        l1_key.zeroize();
        l1_key = next;
    }

    if reseed_l2 {
        l2 = MAX_INDEX;
        l2_key.zeroize();
        l2_key = kdf::kdf(
            alg,
            &l1_key,
            &label,
            &seed_context(target_sd, envelope.root_key_id, envelope.l0, l1, l2),
            SEED_KEY_LEN,
        );
    }

    while l2 != request_l2 {
        l2 -= 1;
        let next = kdf::kdf(
            alg,
            &l2_key,
            &label,
            &seed_context(target_sd, envelope.root_key_id, envelope.l0, l1, l2),
            SEED_KEY_LEN,
        );
        l2_key.zeroize();
        l2_key = next;
    }

    l1_key.zeroize();
    Ok(l2_key)
}

fn agree_kek(secret_algorithm: &str, private_key: &[u8], peer_key_info: &[u8]) -> Result<Vec<u8>> {
    if secret_algorithm != SECRET_AGREEMENT_DH {
        return Err(Error::unsupported(
            "secret agreement algorithm",
            secret_algorithm,
        ));
    }
    let peer = FfcdhKey::unpack(peer_key_info)?;
    let private = BigUint::from_bytes_be(private_key);
    let shared = peer.public_key.modpow(&private, &peer.field_order);
    let mut shared_bytes = to_padded_be(&shared, peer.key_length as usize)?;
    let kek = kek_from_shared_secret(&shared_bytes);
    shared_bytes.zeroize();
    Ok(kek)
}

/// SP800-56A over the DH shared secret, the way `BCryptDeriveKey` is driven:
/// otherinfo is AlgorithmID `SHA512`, PartyUInfo `KDS public key` and
/// PartyVInfo `KDS service`, all NUL-terminated UTF-16LE.
fn kek_from_shared_secret(shared: &[u8]) -> Vec<u8> {
    kdf::kdf_concat(
        HashAlg::Sha256,
        shared,
        &utf16_le_nul("SHA512"),
        &utf16_le_nul("KDS public key"),
        &kdf::service_label(),
        32,
    )
}
