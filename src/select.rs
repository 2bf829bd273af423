//! The identity-key contract and the backend chosen to fulfil it.

use tracing::{info, instrument};

use crate::config::{Backend, HsmConfig};
use crate::error::Result;
use crate::sim::SimulatedTpm;
use crate::tpm::TpmDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// EK and SRK exist but no identity key has been activated.
    Provisioned,
    /// An identity key is installed and can sign.
    IdentityReady,
}

/// Operations every HSM backend offers for the device identity.
pub trait IdentityHsm {
    /// Activates a provisioning-service blob and installs the identity key it carries,
    /// replacing any identity key installed before.
    fn activate_identity_key(&mut self, blob: &[u8]) -> Result<()>;

    /// The Endorsement Key public area as a marshaled TPM2B_PUBLIC.
    fn endorsement_key(&self) -> Result<Vec<u8>>;

    /// The Storage Root Key public area as a marshaled TPM2B_PUBLIC.
    fn storage_root_key(&self) -> Result<Vec<u8>>;

    /// HMAC-SHA256 of `data` under the identity key.
    fn sign_with_identity(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Signs `identity` with the identity key, then signs `data` with the result.
    fn derive_and_sign_with_identity(&mut self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>>;

    fn state(&self) -> DeviceState;
}

/// A device handle backed by whichever backend the configuration selects.
pub enum HsmDevice {
    Tpm(TpmDevice),
    Simulator(SimulatedTpm),
}

impl HsmDevice {
    /// Opens the backend named by `config`.
    #[instrument(level = "debug", skip(config), fields(backend = ?config.backend))]
    pub fn create(config: &HsmConfig) -> Result<Self> {
        let device = match config.backend {
            Backend::Tpm => HsmDevice::Tpm(TpmDevice::create(config.tcti_name_conf()?)?),
            Backend::Simulator => HsmDevice::Simulator(SimulatedTpm::create()?),
        };
        info!(backend = ?device.backend(), "HSM device opened");
        Ok(device)
    }

    /// Opens the backend selected by the process-wide environment toggle.
    pub fn from_env() -> Result<Self> {
        Self::create(&HsmConfig::from_env())
    }

    pub fn backend(&self) -> Backend {
        match self {
            HsmDevice::Tpm(_) => Backend::Tpm,
            HsmDevice::Simulator(_) => Backend::Simulator,
        }
    }

    pub fn destroy(self) {
        match self {
            HsmDevice::Tpm(device) => device.destroy(),
            HsmDevice::Simulator(device) => device.destroy(),
        }
    }

    fn inner(&self) -> &dyn IdentityHsm {
        match self {
            HsmDevice::Tpm(device) => device,
            HsmDevice::Simulator(device) => device,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn IdentityHsm {
        match self {
            HsmDevice::Tpm(device) => device,
            HsmDevice::Simulator(device) => device,
        }
    }
}

impl IdentityHsm for HsmDevice {
    fn activate_identity_key(&mut self, blob: &[u8]) -> Result<()> {
        self.inner_mut().activate_identity_key(blob)
    }

    fn endorsement_key(&self) -> Result<Vec<u8>> {
        self.inner().endorsement_key()
    }

    fn storage_root_key(&self) -> Result<Vec<u8>> {
        self.inner().storage_root_key()
    }

    fn sign_with_identity(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.inner_mut().sign_with_identity(data)
    }

    fn derive_and_sign_with_identity(&mut self, data: &[u8], identity: &[u8]) -> Result<Vec<u8>> {
        self.inner_mut().derive_and_sign_with_identity(data, identity)
    }

    fn state(&self) -> DeviceState {
        self.inner().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::sample_blob;
    use crate::error::HsmError;
    use crate::signing;
    use serial_test::serial;

    fn simulator() -> HsmDevice {
        HsmDevice::create(&HsmConfig::default().with_backend(Backend::Simulator)).unwrap()
    }

    #[test]
    fn test_simulator_config_opens_simulator() {
        let device = simulator();
        assert_eq!(device.backend(), Backend::Simulator);
        assert_eq!(device.state(), DeviceState::Provisioned);
        device.destroy();
    }

    #[test]
    fn test_dispatch_reaches_backend() {
        let mut device = simulator();
        assert!(matches!(
            device.sign_with_identity(b"data"),
            Err(HsmError::NotProvisioned(_))
        ));

        device.activate_identity_key(&sample_blob()).unwrap();
        assert_eq!(device.state(), DeviceState::IdentityReady);

        let digest = device.sign_with_identity(b"data").unwrap();
        assert_eq!(digest, signing::sign(b"duplicated identity key", b"data").unwrap());

        let derived = device.sign_with_identity(b"module").unwrap();
        assert_eq!(
            device.derive_and_sign_with_identity(b"data", b"module").unwrap(),
            signing::sign(&derived, b"data").unwrap()
        );
    }

    #[test]
    fn test_public_keys_are_stable() {
        let device = simulator();
        let ek = device.endorsement_key().unwrap();
        let srk = device.storage_root_key().unwrap();

        let other = simulator();
        assert_eq!(other.endorsement_key().unwrap(), ek);
        assert_eq!(other.storage_root_key().unwrap(), srk);
    }

    #[test]
    #[serial]
    fn test_env_selection_is_consistent() {
        let config = HsmConfig::from_env();
        assert_eq!(config.backend, Backend::from_env());
        assert_eq!(HsmConfig::from_env().backend, config.backend);
    }
}
