//! HMAC-SHA256 signing shared by software keys and the TPM derive-and-sign path.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::trace;
use zeroize::Zeroizing;

use crate::error::{HsmError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size in bytes of every digest produced by this module.
pub const DIGEST_SIZE: usize = 32;

/// Computes HMAC-SHA256 of `data` under `key`.
///
/// The returned buffer is owned by the caller.
pub fn sign(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(HsmError::InvalidParameter("signing key must not be empty"));
    }
    if data.is_empty() {
        return Err(HsmError::InvalidParameter("data to sign must not be empty"));
    }

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| HsmError::InvalidParameter("signing key was rejected"))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes().to_vec();

    trace!(data_len = data.len(), digest_len = digest.len(), "computed HMAC");
    Ok(digest)
}

/// Signs `identity` with `key` to obtain a derived key, then signs `data` with it.
///
/// The derived key is wiped before returning.
pub fn derive_and_sign(key: &[u8], data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
    if identity.is_empty() {
        return Err(HsmError::InvalidParameter("identity must not be empty"));
    }
    let derived = Zeroizing::new(sign(key, identity)?);
    sign(&derived, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2
    #[test]
    fn test_rfc4231_vector() {
        let digest = sign(b"Jefe", b"what do ya want for nothing?").unwrap();
        let expected: [u8; DIGEST_SIZE] = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_derive_and_sign_chains_two_hmacs() {
        let key = b"device primary key";
        let derived = sign(key, b"module-a").unwrap();
        let expected = sign(&derived, b"payload").unwrap();

        assert_eq!(derive_and_sign(key, b"payload", b"module-a").unwrap(), expected);
        assert_ne!(
            derive_and_sign(key, b"payload", b"module-b").unwrap(),
            expected
        );
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        assert!(matches!(
            sign(b"", b"data"),
            Err(HsmError::InvalidParameter(_))
        ));
        assert!(matches!(
            sign(b"key", b""),
            Err(HsmError::InvalidParameter(_))
        ));
        assert!(matches!(
            derive_and_sign(b"key", b"data", b""),
            Err(HsmError::InvalidParameter(_))
        ));
    }
}
