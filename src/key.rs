//! Key handles that hide which primitive backs a given secret.
//!
//! Each kind implements the operations it supports and reports
//! [`HsmError::Unsupported`] for the rest, without touching any key material.

use std::fmt;

use secrecy::{ExposeSecret, SecretSlice};
use tracing::debug;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypt::EncryptionKey;
use crate::error::{HsmError, Result};
use crate::signing;

/// The operations a key handle may offer.
pub trait KeyOps {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn derive_and_sign(&self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>>;

    fn encrypt(&self, identity: &[u8], plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(
        &self,
        identity: &[u8],
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// A shared access signature key, used for HMAC-SHA256 only.
pub struct SasKey {
    key: SecretSlice<u8>,
}

impl SasKey {
    pub const KIND: &'static str = "SAS";

    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(HsmError::InvalidParameter("SAS key must not be empty"));
        }
        Ok(Self {
            key: SecretSlice::from(key.to_vec()),
        })
    }
}

impl ZeroizeOnDrop for SasKey {}

impl KeyOps for SasKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        signing::sign(self.key.expose_secret(), data)
    }

    fn derive_and_sign(&self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        signing::derive_and_sign(self.key.expose_secret(), data, identity)
    }

    fn encrypt(&self, _identity: &[u8], _plaintext: &[u8], _iv: &[u8]) -> Result<Vec<u8>> {
        Err(HsmError::unsupported("encrypt", Self::KIND))
    }

    fn decrypt(
        &self,
        _identity: &[u8],
        _ciphertext: &[u8],
        _iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        Err(HsmError::unsupported("decrypt", Self::KIND))
    }
}

impl EncryptionKey {
    pub const KIND: &'static str = "encryption";
}

impl KeyOps for EncryptionKey {
    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
        Err(HsmError::unsupported("sign", Self::KIND))
    }

    fn derive_and_sign(&self, _data: &[u8], _identity: &[u8]) -> Result<Vec<u8>> {
        Err(HsmError::unsupported("derive_and_sign", Self::KIND))
    }

    fn encrypt(&self, identity: &[u8], plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        EncryptionKey::encrypt(self, identity, plaintext, iv)
    }

    fn decrypt(
        &self,
        identity: &[u8],
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        EncryptionKey::decrypt(self, identity, ciphertext, iv)
    }
}

/// Signing provided by the certificate subsystem for asymmetric keys.
pub trait CertificateSigner: Send {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn derive_and_sign(&self, _data: &[u8], _identity: &[u8]) -> Result<Vec<u8>> {
        Err(HsmError::unsupported("derive_and_sign", CertificateKey::KIND))
    }
}

/// An asymmetric key whose private half lives with the certificate subsystem.
pub struct CertificateKey {
    signer: Box<dyn CertificateSigner>,
}

impl CertificateKey {
    pub const KIND: &'static str = "certificate";

    pub fn new(signer: Box<dyn CertificateSigner>) -> Self {
        Self { signer }
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateKey").finish_non_exhaustive()
    }
}

impl KeyOps for CertificateKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.signer.sign(data)
    }

    fn derive_and_sign(&self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        self.signer.derive_and_sign(data, identity)
    }

    fn encrypt(&self, _identity: &[u8], _plaintext: &[u8], _iv: &[u8]) -> Result<Vec<u8>> {
        Err(HsmError::unsupported("encrypt", Self::KIND))
    }

    fn decrypt(
        &self,
        _identity: &[u8],
        _ciphertext: &[u8],
        _iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        Err(HsmError::unsupported("decrypt", Self::KIND))
    }
}

/// A key handle of any supported kind.
pub enum HsmKey {
    Sas(SasKey),
    Encryption(EncryptionKey),
    Certificate(CertificateKey),
}

impl HsmKey {
    /// Wraps raw SAS key bytes. Fails on an empty key.
    pub fn sas(key: &[u8]) -> Result<Self> {
        SasKey::from_slice(key).map(HsmKey::Sas)
    }

    /// Wraps raw AES-256 key bytes. Fails unless the key is exactly 32 bytes.
    pub fn encryption(key: &[u8]) -> Result<Self> {
        EncryptionKey::from_slice(key).map(HsmKey::Encryption)
    }

    pub fn certificate(signer: Box<dyn CertificateSigner>) -> Self {
        HsmKey::Certificate(CertificateKey::new(signer))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HsmKey::Sas(_) => SasKey::KIND,
            HsmKey::Encryption(_) => EncryptionKey::KIND,
            HsmKey::Certificate(_) => CertificateKey::KIND,
        }
    }

    /// Releases the handle. Symmetric key material is wiped.
    pub fn destroy(self) {
        debug!(kind = self.kind(), "Destroying key handle");
        drop(self);
    }

    fn ops(&self) -> &dyn KeyOps {
        match self {
            HsmKey::Sas(key) => key,
            HsmKey::Encryption(key) => key,
            HsmKey::Certificate(key) => key,
        }
    }
}

impl fmt::Debug for HsmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HsmKey").field(&self.kind()).finish()
    }
}

impl KeyOps for HsmKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.ops().sign(data)
    }

    fn derive_and_sign(&self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        self.ops().derive_and_sign(data, identity)
    }

    fn encrypt(&self, identity: &[u8], plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        self.ops().encrypt(identity, plaintext, iv)
    }

    fn decrypt(
        &self,
        identity: &[u8],
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ops().decrypt(identity, ciphertext, iv)
    }
}
