//! Client-side DPAPI-NG primitives over GKDI group keys.
//!
//! A DPAPI-NG blob is a CMS `EnvelopedData` whose key-encryption-key is
//! derived from a domain-wide seed tree addressed by
//! `(root key id, L0, L1, L2)` and bound to a target security descriptor.
//! This crate owns everything that does not touch the network: the blob and
//! key identifier codecs, the SP800-108/SP800-56A KDFs, the seed-tree
//! ratchet, CEK/content crypto and the ratchet-aware key cache. The
//! companion client crate supplies the DNS/RPC transports and the
//! `NCryptProtectSecret`/`NCryptUnprotectSecret` equivalents built on top.

pub mod blob;
pub mod cache;
pub mod crypto;
mod error;
pub mod gkdi;
pub mod kdf;
pub mod key_id;
pub mod protect;
pub mod sd;
mod wire;

pub use blob::{DpapiNgBlob, ProtectionDescriptor};
pub use cache::KeyCache;
pub use error::{Error, Result};
pub use gkdi::{GroupKeyEnvelope, RootKey};
pub use key_id::KeyIdentifier;
pub use protect::{decrypt_blob, encrypt_blob};
