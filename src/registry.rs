//! Registry adapter: blocking index-driven queries against consul
//!
//! One operation: `query(service, tag, passing_only, last_index)` blocks until
//! the registry's view advances past `last_index` or the max wait elapses, and
//! returns the entries plus the new index to pass back on the next poll. The
//! adapter holds no state between calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{CallError, SdConfig};

/// One service instance as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl RegistryEntry {
    /// `host:port` instance string; identity for the rest of the engine.
    pub fn instance(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Read access to a service registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Blocking query for healthy instances of `service`.
    ///
    /// The registry's native query supports at most one tag filter; callers
    /// needing more filter the result themselves. Returns the entries and the
    /// index to pass on the next call.
    async fn query(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
        last_index: u64,
    ) -> Result<(Vec<RegistryEntry>, u64), CallError>;
}

const INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node", default)]
    node: NodeInfo,
    #[serde(rename = "Service")]
    service: ServiceInfo,
}

#[derive(Debug, Deserialize, Default)]
struct NodeInfo {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// Consul health-endpoint adapter.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    http: reqwest::Client,
    address: String,
    datacenter: String,
    max_wait: Duration,
}

impl ConsulRegistry {
    /// Adapter against the agent at `address`, scoped to `datacenter`.
    pub fn new(address: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.into(),
            datacenter: datacenter.into(),
            max_wait: Duration::from_secs(10),
        }
    }

    /// Build an adapter from an [`SdConfig`]; direct mode has no registry.
    pub fn from_config(cfg: &SdConfig) -> Option<Self> {
        match cfg {
            SdConfig::Consul { address, datacenter } => {
                Some(Self::new(address.clone(), datacenter.clone()))
            }
            SdConfig::None => None,
        }
    }

    /// Override the long-poll ceiling.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

#[async_trait]
impl RegistryClient for ConsulRegistry {
    async fn query(
        &self,
        service: &str,
        tag: Option<&str>,
        passing_only: bool,
        last_index: u64,
    ) -> Result<(Vec<RegistryEntry>, u64), CallError> {
        let url = format!("http://{}/v1/health/service/{}", self.address, service);

        let mut request = self
            .http
            .get(&url)
            .query(&[("index", last_index.to_string())])
            .query(&[("wait", format!("{}s", self.max_wait.as_secs()))])
            .query(&[("dc", self.datacenter.as_str())]);
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }
        if let Some(tag) = tag {
            request = request.query(&[("tag", tag)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallError::Transport { message: e.to_string() })?;

        let new_index = parse_index(response.headers().get(INDEX_HEADER))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Transport {
                message: format!("registry query for {} returned status {}", service, status),
            });
        }

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| CallError::Decoding { status: status.as_u16(), message: e.to_string() })?;

        let entries = entries
            .into_iter()
            .map(|entry| {
                let address = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                RegistryEntry { address, port: entry.service.port, tags: entry.service.tags }
            })
            .collect();

        Ok((entries, new_index))
    }
}

fn parse_index(header: Option<&reqwest::header::HeaderValue>) -> Result<u64, CallError> {
    let Some(value) = header else {
        // Some proxies strip the header; restart blocking from scratch.
        return Ok(0);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| CallError::Decoding {
            status: 200,
            message: format!("malformed {} header: {:?}", INDEX_HEADER, value),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_decodes_from_consul_payload() {
        let payload = r#"[
            {
                "Node": {"Address": "10.0.0.9"},
                "Service": {"Address": "10.0.0.1", "Port": 8080, "Tags": ["stg", "weight_25"]}
            },
            {
                "Node": {"Address": "10.0.0.2"},
                "Service": {"Address": "", "Port": 9090}
            }
        ]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].service.address, "10.0.0.1");
        assert_eq!(entries[0].service.tags, vec!["stg", "weight_25"]);
        // Service address wins when present; node address is the fallback.
        assert!(entries[1].service.address.is_empty());
        assert_eq!(entries[1].node.address, "10.0.0.2");
    }

    #[test]
    fn instance_string_is_host_port() {
        let entry =
            RegistryEntry { address: "10.0.0.1".into(), port: 8080, tags: vec![] };
        assert_eq!(entry.instance(), "10.0.0.1:8080");
    }

    #[test]
    fn index_header_parses() {
        let value = reqwest::header::HeaderValue::from_static("42");
        assert_eq!(parse_index(Some(&value)).unwrap(), 42);
    }

    #[test]
    fn missing_index_header_restarts_from_zero() {
        assert_eq!(parse_index(None).unwrap(), 0);
    }

    #[test]
    fn malformed_index_header_is_a_decoding_error() {
        let value = reqwest::header::HeaderValue::from_static("not-a-number");
        let err = parse_index(Some(&value)).unwrap_err();
        assert_eq!(err.kind(), "decoding");
    }

    #[test]
    fn from_config_only_builds_for_consul() {
        let consul = SdConfig::Consul { address: "localhost:8500".into(), datacenter: "dc1".into() };
        assert!(ConsulRegistry::from_config(&consul).is_some());
        assert!(ConsulRegistry::from_config(&SdConfig::None).is_none());
    }
}
