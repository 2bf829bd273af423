//! Backend selection and TPM connection settings.

use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;
use tss_esapi::TctiNameConf;

use crate::error::Result;

/// Environment toggle choosing the hardware TPM over the in-memory simulator.
pub const TPM_SELECT_ENV: &str = "IOTEDGE_USE_TPM_DEVICE";

// Compared case-insensitively.
const DISABLING_VALUES: [&str; 4] = ["", "off", "no", "false"];

static SELECTED_BACKEND: OnceLock<Backend> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// TPM 2.0 hardware reached through a TCTI.
    Tpm,
    /// In-memory stand-in with the same contract.
    #[default]
    Simulator,
}

impl Backend {
    /// Interprets the toggle value. An unset toggle selects the simulator.
    pub fn from_toggle(value: Option<&str>) -> Self {
        match value {
            None => Backend::Simulator,
            Some(value) => {
                if DISABLING_VALUES
                    .iter()
                    .any(|disabled| value.eq_ignore_ascii_case(disabled))
                {
                    Backend::Simulator
                } else {
                    Backend::Tpm
                }
            }
        }
    }

    /// The backend chosen by [`TPM_SELECT_ENV`].
    ///
    /// The variable is read on first call only; later calls return the cached choice.
    pub fn from_env() -> Self {
        *SELECTED_BACKEND.get_or_init(|| {
            let value =
                std::env::var_os(TPM_SELECT_ENV).map(|v| v.to_string_lossy().into_owned());
            let backend = Backend::from_toggle(value.as_deref());
            info!(?backend, "Selected HSM backend from {}", TPM_SELECT_ENV);
            backend
        })
    }
}

pub fn default_tcti_handle() -> TctiNameConf {
    TctiNameConf::from_environment_variable().unwrap_or(TctiNameConf::Device(Default::default()))
}

/// Settings needed to open an HSM device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    pub backend: Backend,
    /// TCTI configuration string, e.g. `device:/dev/tpmrm0` or `swtpm:host=localhost,port=2321`.
    /// Falls back to the `TCTI` environment variable, then to the kernel resource manager.
    pub tcti: Option<String>,
}

impl HsmConfig {
    pub fn from_env() -> Self {
        Self {
            backend: Backend::from_env(),
            tcti: None,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = Some(tcti.into());
        self
    }

    pub fn tcti_name_conf(&self) -> Result<TctiNameConf> {
        match &self.tcti {
            Some(tcti) => Ok(TctiNameConf::from_str(tcti)?),
            None => Ok(default_tcti_handle()),
        }
    }
}
