//! TPM-backed device identity and symmetric key operations for IoT edge agents.
//!
//! ```no_run
//! use edge_hsm::{HsmDevice, IdentityHsm};
//!
//! # fn main() -> edge_hsm::Result<()> {
//! # let blob: Vec<u8> = Vec::new();
//! let mut device = HsmDevice::from_env()?;
//! device.activate_identity_key(&blob)?;
//! let signature = device.derive_and_sign_with_identity(b"payload", b"module-id")?;
//! # drop(signature);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod config;
pub mod crypt;
pub mod error;
pub mod key;
pub mod select;
pub mod signing;
pub mod sim;
pub mod templates;
pub mod tpm;

pub use config::{Backend, HsmConfig};
pub use crypt::{EncryptionKey, decrypt, encrypt, generate_encryption_key};
pub use error::{HsmError, Result};
pub use key::{CertificateSigner, HsmKey, KeyOps};
pub use select::{DeviceState, HsmDevice, IdentityHsm};
pub use sim::SimulatedTpm;
pub use tpm::TpmDevice;
