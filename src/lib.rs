#![forbid(unsafe_code)]

//! # dialkit
//!
//! Resilient outbound HTTP calls for microservice clients: registry-driven
//! instance discovery, weighted tag-aware load balancing, and per-endpoint
//! circuit breaking, behind one client façade.
//!
//! ## Features
//!
//! - **Service discovery** via blocking index-driven registry polls, with a
//!   per-service watcher that never drops the latest snapshot
//! - **Endpoint pools** that lifecycle one call target per live instance
//! - **Circuit breakers** keyed per `(addr, uri, method)` with rolling-window
//!   thresholds, sleep windows, and half-open probes
//! - **Weighted random load balancing** steered by instance tags
//! - **Prometheus metrics** for calls and breaker outcomes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dialkit::{CallCtx, Client, ClientContext, RequestBody, SdConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dialkit::CallError> {
//!     let ctx = ClientContext::builder()
//!         .source("checkout")
//!         .sd_config(SdConfig::parse("consul::localhost:8500/dc1")?)
//!         .build()?;
//!
//!     let client = Client::new(ctx, "inventory").await?;
//!     let stock: serde_json::Value = client
//!         .do_json(&CallCtx::background(), "/stock/42", "GET", RequestBody::empty())
//!         .await?;
//!     println!("{stock}");
//!     Ok(())
//! }
//! ```

mod backoff;
mod breaker;
mod breaker_registry;
mod client;
mod clock;
mod config;
mod context;
mod error;
mod instancer;
mod lb;
mod metrics;
mod middleware;
mod pool;
mod registry;
mod settings;
mod transport;

// Re-exports
pub use backoff::Backoff;
pub use breaker::{Breaker, BreakerState, WindowTotals};
pub use breaker_registry::BreakerRegistry;
pub use client::{Client, ClientContext, ClientContextBuilder};
pub use clock::{Clock, MonotonicClock};
pub use config::{ConfigError, SdConfig, SD_ENV};
pub use context::{CallCtx, CancelHandle};
pub use error::CallError;
pub use instancer::{Instancer, Snapshot, TagMap};
pub use lb::{LoadBalancer, WeightedRandom};
pub use metrics::CallMetrics;
pub use pool::EndpointPool;
pub use registry::{ConsulRegistry, RegistryClient, RegistryEntry};
pub use settings::{
    BreakerConfig, EndpointSetting, FileSettingProvider, SettingError, SettingProvider,
    DEFAULT_ERROR_PERCENT_THRESHOLD, DEFAULT_MAX_CONCURRENT_REQUESTS,
    DEFAULT_REQUEST_VOLUME_THRESHOLD, DEFAULT_SLEEP_WINDOW_MS, DEFAULT_TIMEOUT_MS,
};
pub use transport::RequestBody;
