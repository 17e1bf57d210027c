//! Contracts for the external collaborators: SRV resolution of a domain
//! controller and the authenticated MS-GKDI `GetKey` exchange. The crate
//! never performs I/O itself; implementations plug in here.

use async_trait::async_trait;
use dshield_core::{GroupKeyEnvelope, Result};
use uuid::Uuid;

/// Authentication protocol for the RPC bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthProtocol {
    /// SPNEGO negotiation, the default everywhere Windows is involved.
    #[default]
    Negotiate,
    Kerberos,
    Ntlm,
}

impl AuthProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProtocol::Negotiate => "negotiate",
            AuthProtocol::Kerberos => "kerberos",
            AuthProtocol::Ntlm => "ntlm",
        }
    }
}

/// Explicit credentials for the `GetKey` bind; all-`None` means the ambient
/// identity (for Kerberos, whatever `kinit` produced).
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials<'a> {
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub auth_protocol: AuthProtocol,
}

/// A resolved domain controller.
#[derive(Debug, Clone)]
pub struct DomainController {
    /// Hostname from the SRV target.
    pub target: String,
}

/// One `GetKey` invocation. `-1` for the three indices asks the server to
/// select the current interval (the protect path); explicit indices address
/// the leaf a blob was protected under (the unprotect path).
#[derive(Debug, Clone, Copy)]
pub struct GetKeyRequest<'a> {
    pub server: &'a str,
    pub target_sd: &'a [u8],
    pub root_key_id: Option<Uuid>,
    pub l0: i32,
    pub l1: i32,
    pub l2: i32,
    pub credentials: Credentials<'a>,
}

/// Blocking collaborator: DNS SRV lookup plus the EPM-mapped, NDR64-bound
/// ISD_KEY `GetKey` call.
pub trait GroupKeyTransport {
    /// Resolve a domain controller for `domain` (or the joined domain when
    /// `None`) via `_ldap._tcp` SRV records.
    fn lookup_dc(&self, domain: Option<&str>) -> Result<DomainController>;

    /// Invoke `GetKey` against `request.server` and decode the returned
    /// group key envelope.
    fn get_key(&self, request: GetKeyRequest<'_>) -> Result<GroupKeyEnvelope>;
}

/// Task-based variant of [`GroupKeyTransport`] suspending at exactly the
/// I/O boundary.
#[async_trait]
pub trait AsyncGroupKeyTransport: Send + Sync {
    async fn lookup_dc(&self, domain: Option<&str>) -> Result<DomainController>;

    async fn get_key(&self, request: GetKeyRequest<'_>) -> Result<GroupKeyEnvelope>;
}
