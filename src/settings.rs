//! Endpoint settings and the setting provider seam
//!
//! Breaker settings are declared per target host as a list of
//! `(uri, method, hystrix)` records:
//!
//! ```yaml
//! settings:
//!   service-a:
//!     - uri: /good
//!       method: GET
//!       hystrix:
//!         timeout: 100
//!         max_concurrent_requests: 10
//!     - uri: /slow
//!       method: POST
//! ```
//!
//! Missing or zero numeric fields fall back to the defaults below; unknown
//! fields are ignored.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 500;
pub const DEFAULT_ERROR_PERCENT_THRESHOLD: u32 = 50;
pub const DEFAULT_SLEEP_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_VOLUME_THRESHOLD: u64 = 20;

/// Circuit breaker configuration for one endpoint.
///
/// A zero value in any field means "use the default"; call
/// [`BreakerConfig::or_defaults`] before handing the config to a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BreakerConfig {
    /// End-to-end deadline for a single call, in milliseconds
    #[serde(default, rename = "timeout")]
    pub timeout_ms: u64,
    /// Semaphore width
    #[serde(default)]
    pub max_concurrent_requests: usize,
    /// Open threshold, percent of errored attempts in the rolling window
    #[serde(default)]
    pub error_percent_threshold: u32,
    /// Half-open retry interval, in milliseconds
    #[serde(default, rename = "sleep_window")]
    pub sleep_window_ms: u64,
    /// Minimum samples in the window before the threshold is evaluated
    #[serde(default)]
    pub request_volume_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            error_percent_threshold: DEFAULT_ERROR_PERCENT_THRESHOLD,
            sleep_window_ms: DEFAULT_SLEEP_WINDOW_MS,
            request_volume_threshold: DEFAULT_REQUEST_VOLUME_THRESHOLD,
        }
    }
}

impl BreakerConfig {
    /// Replace zero fields with their defaults.
    pub fn or_defaults(mut self) -> Self {
        if self.timeout_ms == 0 {
            self.timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        if self.max_concurrent_requests == 0 {
            self.max_concurrent_requests = DEFAULT_MAX_CONCURRENT_REQUESTS;
        }
        if self.error_percent_threshold == 0 {
            self.error_percent_threshold = DEFAULT_ERROR_PERCENT_THRESHOLD;
        }
        if self.sleep_window_ms == 0 {
            self.sleep_window_ms = DEFAULT_SLEEP_WINDOW_MS;
        }
        if self.request_volume_threshold == 0 {
            self.request_volume_threshold = DEFAULT_REQUEST_VOLUME_THRESHOLD;
        }
        self
    }

    fn zeroed() -> Self {
        Self {
            timeout_ms: 0,
            max_concurrent_requests: 0,
            error_percent_threshold: 0,
            sleep_window_ms: 0,
            request_volume_threshold: 0,
        }
    }
}

/// Breaker and timeout settings for one `(uri, method)` call shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointSetting {
    pub uri: String,
    pub method: String,
    #[serde(default = "BreakerConfig::zeroed", rename = "hystrix")]
    pub breaker: BreakerConfig,
}

impl EndpointSetting {
    /// Pool-map key for this setting, `"<METHOD>-<uri>"`.
    pub fn key(&self) -> String {
        endpoint_key(&self.uri, &self.method)
    }
}

/// Pool-map key for a `(uri, method)` pair.
pub(crate) fn endpoint_key(uri: &str, method: &str) -> String {
    format!("{}-{}", method, uri)
}

/// Errors raised while loading a setting file.
#[derive(Debug, Error)]
pub enum SettingError {
    #[error("fail to read setting file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fail to parse setting file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Supplies per-(target, uri, method) breaker settings.
pub trait SettingProvider: Send + Sync {
    /// Settings for a target host, keyed by `"<METHOD>-<uri>"`.
    /// Unknown targets yield an empty map.
    fn get_settings(&self, target: &str) -> HashMap<String, EndpointSetting>;

    /// Install a hot-reload handler. Providers without reload support keep
    /// the default no-op.
    fn on_update(&self, _handler: Arc<dyn Fn(EndpointSetting) + Send + Sync>) {}
}

#[derive(Debug, Deserialize)]
struct SettingHolder {
    #[serde(default)]
    settings: HashMap<String, Vec<EndpointSetting>>,
}

/// File-backed provider loading a YAML `settings:` document once at startup.
#[derive(Debug)]
pub struct FileSettingProvider {
    setting_map: HashMap<String, HashMap<String, EndpointSetting>>,
}

impl FileSettingProvider {
    /// Load and index the setting file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| SettingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data).map_err(|source| SettingError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parse a setting document from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        let holder: SettingHolder = serde_yaml::from_str(data)?;

        let mut setting_map = HashMap::new();
        for (target, settings) in holder.settings {
            let mut by_key = HashMap::new();
            for setting in settings {
                by_key.insert(setting.key(), setting);
            }
            setting_map.insert(target, by_key);
        }

        Ok(Self { setting_map })
    }
}

impl SettingProvider for FileSettingProvider {
    fn get_settings(&self, target: &str) -> HashMap<String, EndpointSetting> {
        self.setting_map.get(target).cloned().unwrap_or_default()
    }
}
