//! Service discovery configuration
//!
//! Discovery is configured from a single string of the form
//! `"<type>::<address>/<datacenter>"`, e.g. `"consul::localhost:8500/dc1"`,
//! usually supplied through the `DIALKIT_SD` environment variable.

use thiserror::Error;

/// Environment variable holding the service discovery config string.
pub const SD_ENV: &str = "DIALKIT_SD";

/// Errors raised while parsing discovery configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("empty service discovery config")]
    Empty,
    #[error("bad service discovery config: {0:?}")]
    Malformed(String),
    #[error("unsupported service discovery type: {0:?}")]
    UnsupportedType(String),
}

impl From<ConfigError> for crate::CallError {
    fn from(err: ConfigError) -> Self {
        crate::CallError::Config { message: err.to_string() }
    }
}

/// Where instances come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdConfig {
    /// Long-poll a consul agent at `address`, scoped to `datacenter`.
    Consul { address: String, datacenter: String },
    /// No discovery; pools resolve the caller-provided host directly.
    None,
}

impl SdConfig {
    /// Parse a `"<type>::<address>/<datacenter>"` config string.
    pub fn parse(cfg: &str) -> Result<Self, ConfigError> {
        if cfg.is_empty() {
            return Err(ConfigError::Empty);
        }
        if cfg == "none" {
            return Ok(SdConfig::None);
        }

        let (ty, info) = cfg.split_once("::").ok_or_else(|| ConfigError::Malformed(cfg.into()))?;
        match ty {
            "consul" => {
                let (address, datacenter) =
                    info.split_once('/').ok_or_else(|| ConfigError::Malformed(cfg.into()))?;
                if address.is_empty() || datacenter.is_empty() {
                    return Err(ConfigError::Malformed(cfg.into()));
                }
                Ok(SdConfig::Consul {
                    address: address.to_string(),
                    datacenter: datacenter.to_string(),
                })
            }
            other => Err(ConfigError::UnsupportedType(other.into())),
        }
    }

    /// Read the config from [`SD_ENV`], falling back to direct mode when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(SD_ENV) {
            Ok(val) => Self::parse(&val),
            Err(_) => Ok(SdConfig::None),
        }
    }
}
