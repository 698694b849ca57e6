//! Per-pool HTTP transport and the call target it serves
//!
//! One `reqwest::Client` per pool, long-lived so connections are reused.
//! Keep-alive is 3600 s, the idle pool is sized to the concurrency limit,
//! the dial timeout is half the call timeout, and TLS verification is
//! disabled: intra-mesh calls go through addresses, not names, and operators
//! depend on that policy.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::metrics::BreakerLabels;
use crate::settings::BreakerConfig;
use crate::CallError;

/// Body of an outbound request: raw bytes pass through untouched, structured
/// values are serialized to JSON up front.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }

    /// Serialize `value` to JSON immediately; failures surface as
    /// [`CallError::Encoding`] before any endpoint is touched.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, CallError> {
        serde_json::to_vec(value)
            .map(Self::Bytes)
            .map_err(|e| CallError::Encoding { message: e.to_string() })
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Bytes(data) => data,
        }
    }
}

/// A callable bound to one instance: its address plus the breaker identity
/// and metric labels minted when discovery added it.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) addr: String,
    pub(crate) command_key: String,
    pub(crate) endpoint_key: String,
    pub(crate) labels: Arc<BreakerLabels>,
}

/// The shared HTTP client of one pool.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub(crate) fn new(cfg: &BreakerConfig) -> Result<Self, CallError> {
        let timeout = Duration::from_millis(cfg.timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .tcp_keepalive(Duration::from_secs(3_600))
            .pool_max_idle_per_host(cfg.max_concurrent_requests)
            .pool_idle_timeout(None)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CallError::Config { message: format!("http client: {}", e) })?;
        Ok(Self { http, timeout })
    }

    /// Issue `method http://<addr><uri>` and return the body bytes and
    /// numeric status. Status codes are data here, never errors.
    pub(crate) async fn send(
        &self,
        method: reqwest::Method,
        addr: &str,
        uri: &str,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, u16), CallError> {
        let url = format!("http://{}{}", addr, uri);
        let response = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        Ok((bytes.to_vec(), status))
    }

    fn classify(&self, err: reqwest::Error) -> CallError {
        if err.is_timeout() {
            CallError::Timeout { elapsed: self.timeout, timeout: self.timeout }
        } else {
            CallError::Transport { message: err.to_string() }
        }
    }
}
