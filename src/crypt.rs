//! Versioned AES-256-GCM envelope for secrets kept at rest.
//!
//! Envelope layout (version 1):
//!
//! ```text
//! +---------+------------------+----------------+
//! | version | tag (16 bytes)   | ciphertext (N) |
//! +---------+------------------+----------------+
//! ```
//!
//! The caller-supplied identity is bound as associated data and is not stored in
//! the envelope, so decryption only succeeds when the same identity is presented.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use hkdf::Hkdf;
use rand::TryRngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::Sha256;
use tracing::{debug, error, trace};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::{HsmError, Result};

pub const ENCRYPTION_KEY_SIZE: usize = 32;
pub const ENVELOPE_VERSION_V1: u8 = 1;
pub const TAG_SIZE: usize = 16;
pub const ENVELOPE_HEADER_SIZE: usize = 1 + TAG_SIZE;

const GCM_NONCE_SIZE: usize = 12;
const NONCE_INFO: &[u8] = b"edge-hsm aead v1 nonce";
// Buffers are handed to code that sizes them as a C `int`.
const MAX_BUFFER_LEN: usize = i32::MAX as usize;

/// A 256-bit AEAD key.
///
/// The key bytes live in a [`SecretSlice`] and are wiped when the key is dropped.
pub struct EncryptionKey {
    key: SecretSlice<u8>,
}

impl EncryptionKey {
    /// Generates a fresh key from the platform RNG.
    pub fn generate() -> Result<Self> {
        let key = random_bytes(ENCRYPTION_KEY_SIZE)?;
        Self::from_slice(&key)
    }

    /// Wraps existing key bytes. The slice must be exactly 32 bytes long.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        validate_key(key)?;
        Ok(Self {
            key: SecretSlice::new(key.to_vec().into()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    pub fn encrypt(&self, identity: &[u8], plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        encrypt(self.key.expose_secret(), identity, plaintext, iv)
    }

    pub fn decrypt(
        &self,
        identity: &[u8],
        envelope: &[u8],
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        decrypt(self.key.expose_secret(), identity, envelope, iv)
    }
}

// SecretSlice wipes its buffer when dropped.
impl ZeroizeOnDrop for EncryptionKey {}

/// Fills a new buffer with `len` bytes from the operating system RNG.
///
/// There is no fallback source: if the OS RNG fails, so does the call.
pub fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    OsRng.try_fill_bytes(&mut buf).map_err(|e| {
        error!(error = %e, "OS random number generator failed");
        HsmError::Rng(e.to_string())
    })?;
    Ok(buf)
}

/// Generates 32 random bytes suitable for [`EncryptionKey::from_slice`].
pub fn generate_encryption_key() -> Result<EncryptionKey> {
    EncryptionKey::generate()
}

/// Encrypts `plaintext` into a version 1 envelope.
///
/// `identity` is authenticated but not encrypted and not emitted.
pub fn encrypt(key: &[u8], identity: &[u8], plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    validate_key(key)?;
    validate_buffer(identity, "identity must be non-empty and fit in an i32")?;
    validate_buffer(plaintext, "plaintext must be non-empty and fit in an i32")?;
    validate_buffer(iv, "iv must be non-empty and fit in an i32")?;
    if plaintext.len() > MAX_BUFFER_LEN - ENVELOPE_HEADER_SIZE {
        return Err(HsmError::InvalidParameter("plaintext is too large"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| HsmError::InvalidParameter("encryption key must be 32 bytes"))?;
    let nonce = gcm_nonce(iv)?;

    let mut envelope =
        Zeroizing::new(Vec::with_capacity(ENVELOPE_HEADER_SIZE + plaintext.len()));
    envelope.push(ENVELOPE_VERSION_V1);
    envelope.extend_from_slice(&[0u8; TAG_SIZE]);
    envelope.extend_from_slice(plaintext);

    let tag = cipher
        .encrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            identity,
            &mut envelope[ENVELOPE_HEADER_SIZE..],
        )
        .map_err(|_| {
            error!("AES-256-GCM encryption failed");
            HsmError::EncryptionFailed
        })?;
    envelope[1..ENVELOPE_HEADER_SIZE].copy_from_slice(&tag);

    trace!(
        plaintext_len = plaintext.len(),
        envelope_len = envelope.len(),
        "sealed v1 envelope"
    );
    Ok(std::mem::take(&mut *envelope))
}

/// Opens a version 1 envelope produced by [`encrypt`].
///
/// Any authentication failure is reported as [`HsmError::DecryptionFailed`] and no
/// plaintext is returned.
pub fn decrypt(
    key: &[u8],
    identity: &[u8],
    envelope: &[u8],
    iv: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    validate_key(key)?;
    validate_buffer(identity, "identity must be non-empty and fit in an i32")?;
    validate_buffer(envelope, "envelope must be non-empty and fit in an i32")?;
    validate_buffer(iv, "iv must be non-empty and fit in an i32")?;
    if envelope.len() <= ENVELOPE_HEADER_SIZE {
        return Err(HsmError::InvalidParameter(
            "envelope is not larger than its header",
        ));
    }
    if envelope[0] != ENVELOPE_VERSION_V1 {
        debug!(version = envelope[0], "rejecting envelope with unknown version");
        return Err(HsmError::InvalidParameter("unsupported envelope version"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| HsmError::InvalidParameter("encryption key must be 32 bytes"))?;
    let nonce = gcm_nonce(iv)?;

    let (header, ciphertext) = envelope.split_at(ENVELOPE_HEADER_SIZE);
    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            identity,
            &mut plaintext,
            GenericArray::from_slice(&header[1..]),
        )
        .map_err(|_| {
            debug!("v1 envelope failed authentication");
            HsmError::DecryptionFailed
        })?;

    Ok(plaintext)
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() != ENCRYPTION_KEY_SIZE {
        return Err(HsmError::InvalidParameter("encryption key must be 32 bytes"));
    }
    Ok(())
}

fn validate_buffer(buf: &[u8], reason: &'static str) -> Result<()> {
    if buf.is_empty() || buf.len() > MAX_BUFFER_LEN {
        debug!(len = buf.len(), reason, "rejecting buffer");
        return Err(HsmError::InvalidParameter(reason));
    }
    Ok(())
}

/// Maps a caller IV of any length onto the 96-bit GCM nonce.
fn gcm_nonce(iv: &[u8]) -> Result<[u8; GCM_NONCE_SIZE]> {
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    if iv.len() == GCM_NONCE_SIZE {
        nonce.copy_from_slice(iv);
        return Ok(nonce);
    }
    Hkdf::<Sha256>::new(None, iv)
        .expand(NONCE_INFO, &mut nonce)
        .map_err(|_| HsmError::InvalidParameter("iv"))?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_module_scenario() {
        let key = test_key();
        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();

        assert_eq!(envelope.len(), 9 + ENVELOPE_HEADER_SIZE);
        assert_eq!(envelope[0], ENVELOPE_VERSION_V1);

        let plaintext = decrypt(&key, b"MOD", &envelope, b"ABCDEFG").unwrap();
        assert_eq!(plaintext.as_slice(), b"PLAINTEXT");

        let wrong_identity = decrypt(&key, b"MOE", &envelope, b"ABCDEFG");
        assert!(matches!(wrong_identity, Err(HsmError::DecryptionFailed)));
    }

    #[test]
    fn test_round_trip_with_generated_key() {
        let key = EncryptionKey::generate().unwrap();
        let secret = b"a connection string that must stay private";
        let iv = random_bytes(12).unwrap();

        let envelope = key.encrypt(b"edgeAgent", secret, &iv).unwrap();
        assert_ne!(&envelope[ENVELOPE_HEADER_SIZE..], secret.as_slice());

        let plaintext = key.decrypt(b"edgeAgent", &envelope, &iv).unwrap();
        assert_eq!(plaintext.as_slice(), secret.as_slice());
    }

    #[test]
    fn test_envelope_is_fresh_per_call() {
        let key = test_key();
        let first = encrypt(&key, b"MOD", b"PLAINTEXT", b"IV-ONE").unwrap();
        let second = encrypt(&key, b"MOD", b"PLAINTEXT", b"IV-TWO").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampering_is_detected() {
        let key = test_key();
        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();

        for index in 1..envelope.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered[index] ^= 1 << bit;
                let result = decrypt(&key, b"MOD", &tampered, b"ABCDEFG");
                assert!(
                    matches!(result, Err(HsmError::DecryptionFailed)),
                    "flipping bit {bit} of byte {index} was not detected"
                );
            }
        }
    }

    #[test]
    fn test_wrong_iv_fails() {
        let key = test_key();
        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();
        assert!(matches!(
            decrypt(&key, b"MOD", &envelope, b"ABCDEFH"),
            Err(HsmError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = test_key();
        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();
        let other = [0xAAu8; 32];
        assert!(matches!(
            decrypt(&other, b"MOD", &envelope, b"ABCDEFG"),
            Err(HsmError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_version_gate() {
        let key = test_key();
        let mut envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();

        for version in [0u8, 2, 0x7f, 0xff] {
            envelope[0] = version;
            assert!(matches!(
                decrypt(&key, b"MOD", &envelope, b"ABCDEFG"),
                Err(HsmError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_short_envelopes_are_rejected() {
        let key = test_key();
        assert!(decrypt(&key, b"MOD", &[], b"ABCDEFG").is_err());
        for len in 1..=ENVELOPE_HEADER_SIZE {
            let mut envelope = vec![0u8; len];
            envelope[0] = ENVELOPE_VERSION_V1;
            assert!(matches!(
                decrypt(&key, b"MOD", &envelope, b"ABCDEFG"),
                Err(HsmError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_key_length_is_enforced() {
        for len in [0usize, 1, 16, 31, 33, 64] {
            let key = vec![7u8; len];
            assert!(matches!(
                encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG"),
                Err(HsmError::InvalidParameter(_))
            ));
            assert!(matches!(
                decrypt(&key, b"MOD", &[1u8; 40], b"ABCDEFG"),
                Err(HsmError::InvalidParameter(_))
            ));
            assert!(EncryptionKey::from_slice(&key).is_err());
        }
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        let key = test_key();
        assert!(matches!(
            encrypt(&key, b"", b"PLAINTEXT", b"ABCDEFG"),
            Err(HsmError::InvalidParameter(_))
        ));
        assert!(matches!(
            encrypt(&key, b"MOD", b"", b"ABCDEFG"),
            Err(HsmError::InvalidParameter(_))
        ));
        assert!(matches!(
            encrypt(&key, b"MOD", b"PLAINTEXT", b""),
            Err(HsmError::InvalidParameter(_))
        ));

        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", b"ABCDEFG").unwrap();
        assert!(decrypt(&key, b"", &envelope, b"ABCDEFG").is_err());
        assert!(decrypt(&key, b"MOD", &envelope, b"").is_err());
    }

    #[test]
    fn test_twelve_byte_iv_is_used_verbatim() {
        let key = test_key();
        let iv = [9u8; GCM_NONCE_SIZE];
        assert_eq!(gcm_nonce(&iv).unwrap(), iv);

        let envelope = encrypt(&key, b"MOD", b"PLAINTEXT", &iv).unwrap();
        let plaintext = decrypt(&key, b"MOD", &envelope, &iv).unwrap();
        assert_eq!(plaintext.as_slice(), b"PLAINTEXT");
    }

    #[test]
    fn test_generated_keys_differ() {
        let first = generate_encryption_key().unwrap();
        let second = generate_encryption_key().unwrap();
        assert_eq!(first.key().expose_secret().len(), ENCRYPTION_KEY_SIZE);
        assert_ne!(first.key().expose_secret(), second.key().expose_secret());
    }
}
