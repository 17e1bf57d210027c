//! Client-side `NCryptProtectSecret`/`NCryptUnprotectSecret` over GKDI.
//!
//! One orchestration core, two shims: every entry point parses/builds the
//! blob with `dshield-core`, probes the shared [`KeyCache`], and only
//! reaches for the pluggable transport on a miss. Concurrent misses for the
//! same `(root key, target SD, L0)` slot coalesce behind the cache's
//! single-flight lock, so a busy process asks the domain controller once.
//!
//! The sync entry points use `blocking_lock` on that flight lock and must
//! not be called from inside an async runtime; the `async_` variants are
//! the ones to use there.

mod transport;

pub use dshield_core::{
    DpapiNgBlob, Error, GroupKeyEnvelope, KeyCache, KeyIdentifier, ProtectionDescriptor, Result,
    RootKey,
};
pub use transport::{
    AsyncGroupKeyTransport, AuthProtocol, Credentials, DomainController, GetKeyRequest,
    GroupKeyTransport,
};

use dshield_core::{decrypt_blob, encrypt_blob, sd};
use tracing::debug;
use uuid::Uuid;

/// Options for [`ncrypt_protect_secret`] and its async variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtectOptions<'a> {
    /// Pin the root key to derive under; required for cache-served protects.
    pub root_key_id: Option<Uuid>,
    /// Domain controller to use, skipping SRV resolution.
    pub server: Option<&'a str>,
    /// Domain to resolve when no server is given.
    pub domain: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub auth_protocol: AuthProtocol,
    /// Shared key cache; a throwaway per-call cache is used when absent.
    pub cache: Option<&'a KeyCache>,
}

impl<'a> ProtectOptions<'a> {
    fn credentials(&self) -> Credentials<'a> {
        Credentials {
            username: self.username,
            password: self.password,
            auth_protocol: self.auth_protocol,
        }
    }
}

/// Options for [`ncrypt_unprotect_secret`] and its async variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnprotectOptions<'a> {
    /// Domain controller to use, skipping SRV resolution.
    pub server: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub auth_protocol: AuthProtocol,
    /// Shared key cache; a throwaway per-call cache is used when absent.
    pub cache: Option<&'a KeyCache>,
}

impl<'a> UnprotectOptions<'a> {
    fn credentials(&self) -> Credentials<'a> {
        Credentials {
            username: self.username,
            password: self.password,
            auth_protocol: self.auth_protocol,
        }
    }
}

fn unprotect_request<'a>(
    blob: &'a DpapiNgBlob,
    server: &'a str,
    credentials: Credentials<'a>,
) -> GetKeyRequest<'a> {
    let ki = &blob.key_identifier;
    GetKeyRequest {
        server,
        target_sd: &blob.security_descriptor,
        root_key_id: Some(ki.root_key_id),
        l0: ki.l0,
        l1: ki.l1,
        l2: ki.l2,
        credentials,
    }
}

fn blob_domain(blob: &DpapiNgBlob) -> Option<&str> {
    let domain = blob.key_identifier.domain_name.as_str();
    (!domain.is_empty()).then_some(domain)
}

/// Decrypt a DPAPI-NG blob, the `NCryptUnprotectSecret` equivalent.
///
/// The seed for the blob's key identifier comes from `options.cache` when
/// it dominates the request, otherwise from a `GetKey` exchange with
/// `options.server` or an SRV-resolved domain controller.
pub fn ncrypt_unprotect_secret<T: GroupKeyTransport>(
    transport: &T,
    data: &[u8],
    options: &UnprotectOptions<'_>,
) -> Result<Vec<u8>> {
    let blob = DpapiNgBlob::unpack(data)?;
    let local_cache = KeyCache::new();
    let cache = options.cache.unwrap_or(&local_cache);
    let ki = &blob.key_identifier;

    let key = match cache.get(&blob.security_descriptor, ki.root_key_id, ki.l0, ki.l1, ki.l2)? {
        Some(key) => key,
        None => {
            let flight = cache.flight(&blob.security_descriptor, ki.root_key_id, ki.l0);
            let _in_flight = flight.blocking_lock();
            match cache.get(&blob.security_descriptor, ki.root_key_id, ki.l0, ki.l1, ki.l2)? {
                Some(key) => key,
                None => {
                    let server =
                        resolve_server(transport, options.server, blob_domain(&blob))?;
                    debug!(server = %server, l0 = ki.l0, l1 = ki.l1, l2 = ki.l2, "requesting group key");
                    let key =
                        transport.get_key(unprotect_request(&blob, &server, options.credentials()))?;
                    cache.store(&blob.security_descriptor, &key);
                    key
                }
            }
        }
    };

    decrypt_blob(&blob, &key)
}

/// Encrypt `data` for `protection_descriptor`, the `NCryptProtectSecret`
/// equivalent. The descriptor is a SID, bare or in `SID=<sid>` form.
pub fn ncrypt_protect_secret<T: GroupKeyTransport>(
    transport: &T,
    data: &[u8],
    protection_descriptor: &str,
    options: &ProtectOptions<'_>,
) -> Result<Vec<u8>> {
    let descriptor = ProtectionDescriptor::parse(protection_descriptor)?;
    let target_sd = sd::build_target_descriptor(&descriptor.sid)?;
    let local_cache = KeyCache::new();
    let cache = options.cache.unwrap_or(&local_cache);

    let key = match cache.protection_seed(options.root_key_id, &target_sd)? {
        Some(key) => key,
        None => {
            let server = resolve_server(transport, options.server, options.domain)?;
            debug!(server = %server, "requesting current group key");
            let key = transport.get_key(GetKeyRequest {
                server: &server,
                target_sd: &target_sd,
                root_key_id: options.root_key_id,
                l0: -1,
                l1: -1,
                l2: -1,
                credentials: options.credentials(),
            })?;
            cache.store(&target_sd, &key);
            key
        }
    };

    encrypt_blob(data, &key, target_sd)
}

/// Async [`ncrypt_unprotect_secret`].
pub async fn async_ncrypt_unprotect_secret<T: AsyncGroupKeyTransport>(
    transport: &T,
    data: &[u8],
    options: &UnprotectOptions<'_>,
) -> Result<Vec<u8>> {
    let blob = DpapiNgBlob::unpack(data)?;
    let local_cache = KeyCache::new();
    let cache = options.cache.unwrap_or(&local_cache);
    let ki = &blob.key_identifier;

    let key = match cache.get(&blob.security_descriptor, ki.root_key_id, ki.l0, ki.l1, ki.l2)? {
        Some(key) => key,
        None => {
            let flight = cache.flight(&blob.security_descriptor, ki.root_key_id, ki.l0);
            let _in_flight = flight.lock().await;
            match cache.get(&blob.security_descriptor, ki.root_key_id, ki.l0, ki.l1, ki.l2)? {
                Some(key) => key,
                None => {
                    let server =
                        resolve_server_async(transport, options.server, blob_domain(&blob)).await?;
                    debug!(server = %server, l0 = ki.l0, l1 = ki.l1, l2 = ki.l2, "requesting group key");
                    let key = transport
                        .get_key(unprotect_request(&blob, &server, options.credentials()))
                        .await?;
                    cache.store(&blob.security_descriptor, &key);
                    key
                }
            }
        }
    };

    decrypt_blob(&blob, &key)
}

/// Async [`ncrypt_protect_secret`].
pub async fn async_ncrypt_protect_secret<T: AsyncGroupKeyTransport>(
    transport: &T,
    data: &[u8],
    protection_descriptor: &str,
    options: &ProtectOptions<'_>,
) -> Result<Vec<u8>> {
    let descriptor = ProtectionDescriptor::parse(protection_descriptor)?;
    let target_sd = sd::build_target_descriptor(&descriptor.sid)?;
    let local_cache = KeyCache::new();
    let cache = options.cache.unwrap_or(&local_cache);

    let key = match cache.protection_seed(options.root_key_id, &target_sd)? {
        Some(key) => key,
        None => {
            let server = resolve_server_async(transport, options.server, options.domain).await?;
            debug!(server = %server, "requesting current group key");
            let key = transport
                .get_key(GetKeyRequest {
                    server: &server,
                    target_sd: &target_sd,
                    root_key_id: options.root_key_id,
                    l0: -1,
                    l1: -1,
                    l2: -1,
                    credentials: options.credentials(),
                })
                .await?;
            cache.store(&target_sd, &key);
            key
        }
    };

    encrypt_blob(data, &key, target_sd)
}

fn resolve_server<T: GroupKeyTransport>(
    transport: &T,
    explicit: Option<&str>,
    domain: Option<&str>,
) -> Result<String> {
    match explicit {
        Some(server) => Ok(server.to_string()),
        None => {
            let dc = transport.lookup_dc(domain)?;
            debug!(target = %dc.target, "resolved domain controller");
            Ok(dc.target)
        }
    }
}

async fn resolve_server_async<T: AsyncGroupKeyTransport>(
    transport: &T,
    explicit: Option<&str>,
    domain: Option<&str>,
) -> Result<String> {
    match explicit {
        Some(server) => Ok(server.to_string()),
        None => {
            let dc = transport.lookup_dc(domain).await?;
            debug!(target = %dc.target, "resolved domain controller");
            Ok(dc.target)
        }
    }
}
