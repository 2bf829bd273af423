//! In-memory stand-in for [`TpmDevice`](crate::tpm::TpmDevice).
//!
//! Accepts the same activation blobs and exposes the same key formats, but
//! keeps every secret in process memory. Intended for development machines
//! and CI where no TPM is present.

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, info, instrument};
use tss_esapi::structures::{MaxBuffer, Public};
use zeroize::Zeroizing;

use crate::blob::ActivationBlob;
use crate::error::{HsmError, Result};
use crate::select::{DeviceState, IdentityHsm};
use crate::signing;
use crate::templates::{endorsement_key_template, marshal_public, storage_root_key_template};

pub struct SimulatedTpm {
    ek_public: Public,
    srk_public: Public,
    identity_key: Option<SecretSlice<u8>>,
    wrap_key: Option<Zeroizing<Vec<u8>>>,
}

impl SimulatedTpm {
    pub fn create() -> Result<Self> {
        let device = Self {
            ek_public: endorsement_key_template()?,
            srk_public: storage_root_key_template()?,
            identity_key: None,
            wrap_key: None,
        };
        info!("Simulated TPM ready");
        Ok(device)
    }

    pub fn destroy(self) {
        debug!("Closing simulated TPM");
        drop(self);
    }

    /// The wrap key recovered by the most recent activation, if any.
    pub fn wrap_key(&self) -> Option<&[u8]> {
        self.wrap_key.as_deref().map(Vec::as_slice)
    }

    fn identity_key(&self) -> Result<&SecretSlice<u8>> {
        self.identity_key
            .as_ref()
            .ok_or(HsmError::NotProvisioned("identity key"))
    }
}

impl IdentityHsm for SimulatedTpm {
    #[instrument(level = "debug", skip(self, blob), fields(blob_len = blob.len()))]
    fn activate_identity_key(&mut self, blob: &[u8]) -> Result<()> {
        let fields = ActivationBlob::parse(blob)?;
        if fields.credential.is_empty() {
            return Err(HsmError::InvalidParameter("credential must not be empty"));
        }
        if fields.duplicate_private.is_empty() {
            return Err(HsmError::InvalidParameter(
                "duplicated identity key must not be empty",
            ));
        }

        self.wrap_key = Some(Zeroizing::new(fields.credential.to_vec()));
        let replaced = self
            .identity_key
            .replace(SecretSlice::from(fields.duplicate_private.to_vec()))
            .is_some();

        info!(replaced, "Simulated identity key activated");
        Ok(())
    }

    fn endorsement_key(&self) -> Result<Vec<u8>> {
        marshal_public(&self.ek_public)
    }

    fn storage_root_key(&self) -> Result<Vec<u8>> {
        marshal_public(&self.srk_public)
    }

    fn sign_with_identity(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(HsmError::InvalidParameter("data to sign must not be empty"));
        }
        let key = self.identity_key()?;
        // Same input bound as the TPM HMAC command.
        if data.len() > MaxBuffer::MAX_SIZE {
            return Err(HsmError::InvalidParameter(
                "data exceeds the TPM HMAC buffer",
            ));
        }
        signing::sign(key.expose_secret(), data)
    }

    fn derive_and_sign_with_identity(&mut self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(HsmError::InvalidParameter("data to sign must not be empty"));
        }
        let derived = Zeroizing::new(self.sign_with_identity(identity)?);
        signing::sign(&derived, data)
    }

    fn state(&self) -> DeviceState {
        match self.identity_key {
            Some(_) => DeviceState::IdentityReady,
            None => DeviceState::Provisioned,
        }
    }
}
