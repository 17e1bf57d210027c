use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Possible failures while packing, unpacking or deriving DPAPI-NG material.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural violation in a packed structure or DER document.
    #[error("invalid {field} at byte {offset}")]
    InvalidFormat {
        /// Name of the field that failed to parse.
        field: &'static str,
        /// Byte offset of the failing field within its structure.
        offset: usize,
    },

    /// An identifier the implementation does not handle.
    #[error("unsupported {what} '{value}'")]
    Unsupported {
        /// What kind of identifier was rejected.
        what: &'static str,
        /// The offending value.
        value: String,
    },

    /// AES-GCM tag mismatch or AES key-wrap integrity failure.
    #[error("decryption failed: {0}")]
    DecryptionFailed(&'static str),

    /// No cached seed, no loaded root key and no server to ask.
    #[error("key unavailable: {0}")]
    KeyUnavailable(&'static str),

    /// DNS or RPC failure surfaced by the transport.
    #[error("transport failure: {0}")]
    TransportError(String),

    /// Negotiate/Kerberos/NTLM failure surfaced by the transport.
    #[error("authentication failed: {0}")]
    AuthError(String),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, offset: usize) -> Self {
        Error::InvalidFormat { field, offset }
    }

    pub(crate) fn unsupported(what: &'static str, value: impl Into<String>) -> Self {
        Error::Unsupported {
            what,
            value: value.into(),
        }
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        let offset = err
            .position()
            .map(|pos| u32::from(pos) as usize)
            .unwrap_or(0);
        Error::InvalidFormat {
            field: "DER value",
            offset,
        }
    }
}
