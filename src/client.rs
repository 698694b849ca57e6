//! Client façade and the bootstrap context behind it
//!
//! A [`ClientContext`] is built once at process startup and carries the
//! pieces every client shares: the source identity used for metric labels,
//! the service discovery configuration, the setting provider, the metric
//! families, and the breaker registry. One [`Client`] exists per logical
//! host; it routes each `(uri, method)` to its pool, creating pools eagerly
//! from provider settings and lazily (with defaults) for call shapes never
//! declared.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::breaker_registry::BreakerRegistry;
use crate::context::CallCtx;
use crate::instancer::Instancer;
use crate::metrics::CallMetrics;
use crate::pool::EndpointPool;
use crate::registry::{ConsulRegistry, RegistryClient};
use crate::settings::{endpoint_key, BreakerConfig, EndpointSetting, SettingProvider};
use crate::transport::RequestBody;
use crate::{CallError, SdConfig};

/// Process-wide call-engine state, constructed once and shared read-only.
pub struct ClientContext {
    source: String,
    sd: SdConfig,
    provider: Option<Arc<dyn SettingProvider>>,
    metrics: Arc<CallMetrics>,
    breakers: Arc<BreakerRegistry>,
    registry: Option<Arc<dyn RegistryClient>>,
    instancers: RwLock<HashMap<String, Arc<Instancer>>>,
}

/// Builder for [`ClientContext`].
#[derive(Default)]
pub struct ClientContextBuilder {
    source: Option<String>,
    sd: Option<SdConfig>,
    provider: Option<Arc<dyn SettingProvider>>,
    registry: Option<Arc<dyn RegistryClient>>,
    prometheus: Option<Arc<prometheus::Registry>>,
}

impl ClientContextBuilder {
    /// Source identity attached to every metric as the `src` label.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Service discovery configuration; defaults to [`SdConfig::from_env`].
    pub fn sd_config(mut self, sd: SdConfig) -> Self {
        self.sd = Some(sd);
        self
    }

    /// Provider of per-endpoint breaker settings.
    pub fn setting_provider(mut self, provider: Arc<dyn SettingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Custom registry adapter; defaults to consul per the SD config.
    pub fn registry_client(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register metric families into this registry instead of a fresh one.
    pub fn prometheus_registry(mut self, registry: Arc<prometheus::Registry>) -> Self {
        self.prometheus = Some(registry);
        self
    }

    pub fn build(self) -> Result<Arc<ClientContext>, CallError> {
        let sd = match self.sd {
            Some(sd) => sd,
            None => SdConfig::from_env()?,
        };
        let prometheus =
            self.prometheus.unwrap_or_else(|| Arc::new(prometheus::Registry::new()));
        let metrics = Arc::new(
            CallMetrics::new(prometheus)
                .map_err(|e| CallError::Config { message: format!("metrics: {}", e) })?,
        );
        let registry = self.registry.or_else(|| {
            ConsulRegistry::from_config(&sd).map(|c| Arc::new(c) as Arc<dyn RegistryClient>)
        });

        Ok(Arc::new(ClientContext {
            source: self.source.unwrap_or_else(|| "local".to_string()),
            sd,
            provider: self.provider,
            metrics,
            breakers: Arc::new(BreakerRegistry::new()),
            registry,
            instancers: RwLock::new(HashMap::new()),
        }))
    }
}

impl ClientContext {
    pub fn builder() -> ClientContextBuilder {
        ClientContextBuilder::default()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sd_config(&self) -> &SdConfig {
        &self.sd
    }

    /// The metric families, including the scrapeable prometheus registry.
    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    /// The shared breaker registry, for state inspection.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub(crate) fn metrics_arc(&self) -> Arc<CallMetrics> {
        self.metrics.clone()
    }

    pub(crate) fn breakers_arc(&self) -> Arc<BreakerRegistry> {
        self.breakers.clone()
    }

    /// One instancer per service, shared by every pool of that service.
    pub(crate) async fn instancer_for(&self, service: &str) -> Result<Arc<Instancer>, CallError> {
        if let Some(instancer) = self.instancers.read().await.get(service) {
            return Ok(instancer.clone());
        }

        let mut instancers = self.instancers.write().await;
        if let Some(instancer) = instancers.get(service) {
            return Ok(instancer.clone());
        }
        let registry = self.registry.clone().ok_or_else(|| CallError::Config {
            message: "service discovery requested but not configured".to_string(),
        })?;
        let instancer =
            Arc::new(Instancer::spawn(registry, service.to_string(), Vec::new(), true).await);
        instancers.insert(service.to_string(), instancer.clone());
        Ok(instancer)
    }
}

/// Outbound call client for one logical host.
pub struct Client {
    ctx: Arc<ClientContext>,
    host: String,
    instancer: Arc<Instancer>,
    pools: RwLock<HashMap<String, Arc<EndpointPool>>>,
}

impl Client {
    /// Client with service discovery enabled.
    pub async fn new(ctx: Arc<ClientContext>, host: impl Into<String>) -> Result<Self, CallError> {
        Self::with_sd(ctx, host, true).await
    }

    /// Client with discovery on or off; direct mode resolves `host` itself.
    pub async fn with_sd(
        ctx: Arc<ClientContext>,
        host: impl Into<String>,
        use_sd: bool,
    ) -> Result<Self, CallError> {
        let host = host.into();
        let instancer = if use_sd {
            ctx.instancer_for(&host).await?
        } else {
            Arc::new(Instancer::fixed(host.clone()))
        };

        let mut pools = HashMap::new();
        if let Some(provider) = &ctx.provider {
            for (key, setting) in provider.get_settings(&host) {
                match EndpointPool::new(
                    ctx.source(),
                    &host,
                    &setting,
                    &instancer,
                    ctx.metrics_arc(),
                    ctx.breakers_arc(),
                ) {
                    Ok(pool) => {
                        pools.insert(key, Arc::new(pool));
                    }
                    Err(err) => {
                        tracing::error!(
                            host = %host,
                            uri = %setting.uri,
                            method = %setting.method,
                            error = %err,
                            "fail to create endpoint pool"
                        );
                    }
                }
            }
        }

        tracing::info!(host = %host, pools = pools.len(), use_sd, "client created");
        Ok(Self { ctx, host, instancer, pools: RwLock::new(pools) })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Call `(uri, method)` and return raw body bytes plus the status code.
    ///
    /// `body` may be raw bytes (passed through) or a JSON-encoded value.
    pub async fn do_raw(
        &self,
        ctx: &CallCtx,
        uri: &str,
        method: &str,
        body: RequestBody,
    ) -> Result<(Vec<u8>, u16), CallError> {
        let pool = self.pool_for(uri, method).await?;
        pool.do_raw(ctx, body).await
    }

    /// Call `(uri, method)` and JSON-decode the response into `T`.
    pub async fn do_json<T: DeserializeOwned>(
        &self,
        ctx: &CallCtx,
        uri: &str,
        method: &str,
        body: RequestBody,
    ) -> Result<T, CallError> {
        let pool = self.pool_for(uri, method).await?;
        pool.do_json(ctx, body).await
    }

    /// The pool serving `(uri, method)`, creating it with default breaker
    /// configuration on first use. Racing creators resolve to one pool.
    async fn pool_for(&self, uri: &str, method: &str) -> Result<Arc<EndpointPool>, CallError> {
        let key = endpoint_key(uri, method);
        if let Some(pool) = self.pools.read().await.get(&key) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let setting = EndpointSetting {
            uri: uri.to_string(),
            method: method.to_string(),
            breaker: BreakerConfig::default(),
        };
        let pool = Arc::new(EndpointPool::new(
            self.ctx.source(),
            &self.host,
            &setting,
            &self.instancer,
            self.ctx.metrics_arc(),
            self.ctx.breakers_arc(),
        )?);
        tracing::info!(host = %self.host, uri, method, "endpoint pool created with defaults");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Close every pool; targets are retired and delta workers stop.
    pub async fn close(&self) {
        for (_, pool) in self.pools.write().await.drain() {
            pool.close();
        }
    }
}
