//! Registry of per-command circuit breakers
//!
//! Breakers are keyed by command key (`source-host-uri-method-addr`), with a
//! reverse map from endpoint key (`addr-uri-method`) so the pool can ask for
//! breaker state by the address it is about to select.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::breaker::{Breaker, BreakerState};
use crate::clock::{Clock, MonotonicClock};
use crate::context::CallCtx;
use crate::settings::BreakerConfig;
use crate::CallError;

#[derive(Debug, Default)]
struct Inner {
    breakers: HashMap<String, Arc<Breaker>>,
    by_endpoint: HashMap<String, String>,
}

/// Keyed breaker registry shared by all pools of a process.
#[derive(Debug)]
pub struct BreakerRegistry {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    /// Inject a clock shared by every breaker created here (tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { inner: RwLock::new(Inner::default()), clock }
    }

    /// Install a breaker for `command_key` unless one is already installed,
    /// and record the endpoint reverse mapping. Idempotent: repeat calls with
    /// the same key leave exactly one configuration in place.
    pub fn configure_once(&self, command_key: &str, endpoint_key: &str, config: BreakerConfig) {
        {
            let inner = self.inner.read().expect("breaker registry poisoned");
            if inner.breakers.contains_key(command_key) {
                return;
            }
        }

        let mut inner = self.inner.write().expect("breaker registry poisoned");
        if inner.breakers.contains_key(command_key) {
            return;
        }
        inner.breakers.insert(
            command_key.to_string(),
            Arc::new(Breaker::with_clock(config.or_defaults(), self.clock.clone())),
        );
        inner.by_endpoint.insert(endpoint_key.to_string(), command_key.to_string());
        tracing::info!(endpoint = endpoint_key, command = command_key, "breaker configured");
    }

    /// Retrieve the breaker installed for a command key.
    pub fn get(&self, command_key: &str) -> Option<Arc<Breaker>> {
        self.inner.read().expect("breaker registry poisoned").breakers.get(command_key).cloned()
    }

    /// Execute `fut` under the breaker for `command_key`.
    pub async fn run<T, F>(&self, command_key: &str, ctx: &CallCtx, fut: F) -> Result<T, CallError>
    where
        F: std::future::Future<Output = Result<T, CallError>>,
    {
        let breaker = self.get(command_key).ok_or_else(|| CallError::Internal {
            message: format!("no breaker configured for {}", command_key),
        })?;
        breaker.run(ctx, command_key, fut).await
    }

    /// Breaker state for an endpoint key: `Some(open)` when known, `None`
    /// when no breaker is tracked for it.
    pub fn is_open(&self, endpoint_key: &str) -> Option<bool> {
        let inner = self.inner.read().expect("breaker registry poisoned");
        let command = inner.by_endpoint.get(endpoint_key)?;
        inner.breakers.get(command).map(|b| b.is_open())
    }

    /// Calls in flight for a command key, for concurrency observation.
    pub fn in_flight(&self, command_key: &str) -> usize {
        self.get(command_key).map(|b| b.in_flight()).unwrap_or(0)
    }

    /// Drop the breaker and reverse mapping for a retired endpoint. A
    /// re-added address starts over with a fresh configuration observation.
    pub fn cleanup(&self, endpoint_key: &str) {
        let mut inner = self.inner.write().expect("breaker registry poisoned");
        let command = inner.by_endpoint.remove(endpoint_key);
        if let Some(command) = &command {
            inner.breakers.remove(command);
        }
        tracing::info!(endpoint = endpoint_key, command = ?command, "breaker cleaned up");
    }

    /// Snapshot of all breaker states (command key -> state), sorted by key.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let inner = self.inner.read().expect("breaker registry poisoned");
        let mut entries: Vec<(String, BreakerState)> =
            inner.breakers.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
