use thiserror::Error;

/// Errors surfaced by the HSM layer.
///
/// Every TPM failure collapses into [`HsmError::Tpm`]; the wrapped status is for
/// diagnostics only and callers should not branch on it.
#[derive(Error, Debug)]
pub enum HsmError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("{operation} is not supported by {key_kind} keys")]
    Unsupported {
        operation: &'static str,
        key_kind: &'static str,
    },

    #[error("{0} has not been provisioned")]
    NotProvisioned(&'static str),

    #[error("marshaled public area is {size} bytes, larger than the {limit} byte buffer")]
    PublicAreaTooLarge { size: usize, limit: usize },

    #[error("random number generator failure: {0}")]
    Rng(String),

    #[error("malformed TPM response: {0}")]
    MalformedResponse(&'static str),

    #[error(transparent)]
    Tpm(#[from] tss_esapi::Error),
}

pub type Result<T, E = HsmError> = core::result::Result<T, E>;

impl HsmError {
    pub(crate) fn unsupported(operation: &'static str, key_kind: &'static str) -> Self {
        HsmError::Unsupported {
            operation,
            key_kind,
        }
    }
}
