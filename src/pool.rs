//! Endpoint pool: per-(host, uri, method) owner of call targets
//!
//! The pool subscribes to its service's instancer and keeps one [`Target`]
//! per live instance: discovery-add mints a target (and its breaker
//! configuration), discovery-remove retires it exactly once. Surviving
//! targets keep their identity across snapshots, so breaker windows and
//! connection pools carry over. All map mutation happens on the pool's
//! single delta worker; call paths only read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use arc_swap::ArcSwap;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::breaker_registry::BreakerRegistry;
use crate::context::CallCtx;
use crate::instancer::{Instancer, Snapshot, TagMap};
use crate::lb::{LoadBalancer, WeightedRandom};
use crate::metrics::CallMetrics;
use crate::middleware::CallChain;
use crate::settings::{BreakerConfig, EndpointSetting};
use crate::transport::{HttpTransport, RequestBody, Target};
use crate::CallError;

/// Replace `-` so key segments stay splittable on `-`.
fn norm(s: &str) -> String {
    s.replace('-', "_")
}

/// One pool per `(host, uri, method)` call shape.
pub struct EndpointPool {
    inner: Arc<PoolInner>,
    delta_task: Mutex<Option<JoinHandle<()>>>,
}

struct PoolInner {
    host: String,
    uri: String,
    method_label: String,
    command_prefix: String,
    config: BreakerConfig,
    source: String,
    targets: RwLock<HashMap<String, Target>>,
    tags: Arc<ArcSwap<TagMap>>,
    lb: Box<dyn LoadBalancer>,
    chain: CallChain,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<CallMetrics>,
    closed: AtomicBool,
}

impl EndpointPool {
    pub(crate) fn new(
        source: &str,
        host: &str,
        setting: &EndpointSetting,
        instancer: &Instancer,
        metrics: Arc<CallMetrics>,
        breakers: Arc<BreakerRegistry>,
    ) -> Result<Self, CallError> {
        let config = setting.breaker.clone().or_defaults();
        let method =
            reqwest::Method::from_bytes(setting.method.as_bytes()).map_err(|_| {
                CallError::Config { message: format!("bad http method {:?}", setting.method) }
            })?;

        let nsource = norm(source);
        let nhost = norm(host);
        let nuri = norm(&setting.uri);
        let command_prefix =
            format!("{}-{}-{}-{}", nsource, nhost, nuri, setting.method);

        let transport = HttpTransport::new(&config)?;
        let api_labels = metrics.api_labels(&nsource, &nhost, &nuri, &setting.method);
        let chain = CallChain::new(
            method,
            setting.method.clone(),
            setting.uri.clone(),
            api_labels,
            transport,
            metrics.clone(),
            breakers.clone(),
        );

        let inner = Arc::new(PoolInner {
            host: host.to_string(),
            uri: setting.uri.clone(),
            method_label: setting.method.clone(),
            command_prefix,
            config,
            source: nsource,
            targets: RwLock::new(HashMap::new()),
            tags: instancer.tag_swap(),
            lb: Box::new(WeightedRandom::new()),
            chain,
            breakers,
            metrics,
            closed: AtomicBool::new(false),
        });

        inner.apply_snapshot(&instancer.latest());

        let mut rx = instancer.subscribe();
        let weak = Arc::downgrade(&inner);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow().clone();
                let Some(inner) = Weak::upgrade(&weak) else { return };
                inner.apply_snapshot(&snapshot);
            }
        });

        Ok(Self { inner, delta_task: Mutex::new(Some(task)) })
    }

    /// Issue the call and return raw body bytes plus the numeric status.
    pub async fn do_raw(
        &self,
        ctx: &CallCtx,
        body: RequestBody,
    ) -> Result<(Vec<u8>, u16), CallError> {
        self.inner.do_raw(ctx, body).await
    }

    /// Issue the call and JSON-decode the response body into `T`.
    pub async fn do_json<T: DeserializeOwned>(
        &self,
        ctx: &CallCtx,
        body: RequestBody,
    ) -> Result<T, CallError> {
        let (bytes, status) = self.inner.do_raw(ctx, body).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CallError::Decoding { status, message: e.to_string() })
    }

    /// Addresses currently holding a live target, sorted.
    pub fn live_targets(&self) -> Vec<String> {
        let mut addrs: Vec<String> =
            self.inner.targets.read().expect("pool target map poisoned").keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn method(&self) -> &str {
        &self.inner.method_label
    }

    /// Stop the delta worker and retire every target.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.delta_task.lock().expect("pool task slot poisoned").take() {
            task.abort();
        }
        let mut targets = self.inner.targets.write().expect("pool target map poisoned");
        for (_, target) in targets.drain() {
            self.inner.breakers.cleanup(&target.endpoint_key);
        }
        tracing::info!(host = %self.inner.host, uri = %self.inner.uri, "pool closed");
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolInner {
    async fn do_raw(&self, ctx: &CallCtx, body: RequestBody) -> Result<(Vec<u8>, u16), CallError> {
        ctx.check()?;
        let bytes = body.into_bytes();
        let target = self.resolve()?;
        self.chain.call(ctx, &target, bytes).await
    }

    /// Snapshot the live set, drop targets with open breakers (with a 10%
    /// pass-through so a broken target still sees recovery probes), and let
    /// the balancer pick. When every target is open the full set is used
    /// instead: the breaker itself rejects, and `ShortCircuit` beats a
    /// misleading `NoEndpoint`.
    fn resolve(&self) -> Result<Target, CallError> {
        let targets = self.targets.read().expect("pool target map poisoned");
        let tags = self.tags.load();

        let mut live = Vec::with_capacity(targets.len());
        for (addr, target) in targets.iter() {
            if self.breakers.is_open(&target.endpoint_key) == Some(true) {
                if rand::rng().random_range(0..10) != 1 {
                    tracing::debug!(addr = %addr, "circuit open, skipping target");
                    continue;
                }
                tracing::info!(addr = %addr, "circuit open, letting one through");
            }
            live.push(addr.clone());
        }
        if live.is_empty() && !targets.is_empty() {
            live.extend(targets.keys().cloned());
        }

        let chosen = self.lb.select(&self.uri, &self.method_label, &live, &tags)?;
        targets.get(&chosen).cloned().ok_or_else(|| CallError::Internal {
            message: format!("selected address {} vanished from pool", chosen),
        })
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(error) = &snapshot.error {
            // Keep the last-known target set through registry outages.
            tracing::debug!(host = %self.host, error = %error, "discovery error, keeping targets");
            return;
        }

        let fresh: HashSet<&String> = snapshot.instances.iter().collect();
        let mut targets = self.targets.write().expect("pool target map poisoned");

        let mut added = 0usize;
        for addr in &snapshot.instances {
            if targets.contains_key(addr) {
                continue;
            }
            let target = self.make_target(addr);
            self.breakers.configure_once(
                &target.command_key,
                &target.endpoint_key,
                self.config.clone(),
            );
            self.metrics.init_breaker(&target.labels);
            targets.insert(addr.clone(), target);
            added += 1;
        }

        let stale: Vec<String> =
            targets.keys().filter(|addr| !fresh.contains(*addr)).cloned().collect();
        let removed = stale.len();
        for addr in stale {
            if let Some(target) = targets.remove(&addr) {
                self.breakers.cleanup(&target.endpoint_key);
            }
        }

        if added + removed > 0 {
            tracing::info!(
                host = %self.host,
                uri = %self.uri,
                method = %self.method_label,
                added,
                removed,
                live = targets.len(),
                "target set updated"
            );
        }
    }

    fn make_target(&self, addr: &str) -> Target {
        let command_key = format!("{}-{}", self.command_prefix, addr);
        let endpoint_key = format!("{}-{}-{}", addr, self.uri, self.method_label);
        let command_label = format!("{}-{}", self.method_label, norm(&self.uri));
        let labels = self.metrics.breaker_labels(
            &command_label,
            &self.method_label,
            &norm(&self.uri),
            &self.source,
            &norm(&self.host),
            addr,
        );
        Target {
            addr: addr.to_string(),
            command_key,
            endpoint_key,
            labels: Arc::new(labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryClient, RegistryEntry};
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::collections::VecDeque;

    struct ScriptedRegistry {
        steps: tokio::sync::Mutex<VecDeque<Vec<RegistryEntry>>>,
    }

    impl ScriptedRegistry {
        fn new(steps: Vec<Vec<&str>>) -> Arc<Self> {
            let steps = steps
                .into_iter()
                .map(|addrs| {
                    addrs
                        .into_iter()
                        .map(|addr| {
                            let (host, port) = addr.split_once(':').unwrap();
                            RegistryEntry {
                                address: host.into(),
                                port: port.parse().unwrap(),
                                tags: vec![],
                            }
                        })
                        .collect()
                })
                .collect();
            Arc::new(Self { steps: tokio::sync::Mutex::new(steps) })
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedRegistry {
        async fn query(
            &self,
            _service: &str,
            _tag: Option<&str>,
            _passing_only: bool,
            last_index: u64,
        ) -> Result<(Vec<RegistryEntry>, u64), CallError> {
            let step = self.steps.lock().await.pop_front();
            match step {
                Some(entries) => Ok((entries, last_index + 1)),
                None => futures::future::pending().await,
            }
        }
    }

    fn setting(uri: &str, timeout_ms: u64, volume: u64) -> EndpointSetting {
        EndpointSetting {
            uri: uri.into(),
            method: "GET".into(),
            breaker: BreakerConfig {
                timeout_ms,
                max_concurrent_requests: 10,
                error_percent_threshold: 50,
                sleep_window_ms: 5_000,
                request_volume_threshold: volume,
            },
        }
    }

    fn deps() -> (Arc<CallMetrics>, Arc<BreakerRegistry>) {
        (Arc::new(CallMetrics::new(Registry::new()).unwrap()), Arc::new(BreakerRegistry::new()))
    }

    async fn wait_for_targets(pool: &EndpointPool, expect: &[&str]) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if pool.live_targets() == expect {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("targets never became {:?}, got {:?}", expect, pool.live_targets())
        });
    }

    #[tokio::test]
    async fn target_map_follows_snapshots() {
        let registry = ScriptedRegistry::new(vec![
            vec!["10.0.0.1:80"],
            vec!["10.0.0.1:80", "10.0.0.2:80"],
            vec!["10.0.0.2:80"],
        ]);
        let instancer = Instancer::spawn(registry, "svc", vec![], true).await;
        let (metrics, breakers) = deps();
        let pool =
            EndpointPool::new("src", "svc", &setting("/x", 100, 5), &instancer, metrics, breakers.clone())
                .unwrap();

        wait_for_targets(&pool, &["10.0.0.2:80"]).await;

        // The retired address left both the pool and the breaker registry.
        assert_eq!(breakers.is_open("10.0.0.1:80-/x-GET"), None);
        assert_eq!(breakers.is_open("10.0.0.2:80-/x-GET"), Some(false));
    }

    #[tokio::test]
    async fn empty_live_set_is_no_endpoint_without_transport() {
        let registry = ScriptedRegistry::new(vec![vec![]]);
        let instancer = Instancer::spawn(registry, "svc", vec![], true).await;
        let (metrics, breakers) = deps();
        let pool =
            EndpointPool::new("src", "svc", &setting("/x", 100, 5), &instancer, metrics, breakers)
                .unwrap();

        let err = pool.do_raw(&CallCtx::background(), RequestBody::empty()).await.unwrap_err();
        assert!(err.is_no_endpoint());
    }

    async fn force_open(breakers: &BreakerRegistry, command_key: &str, failures: u64) {
        for _ in 0..failures {
            let _: Result<(), _> = breakers
                .run(command_key, &CallCtx::background(), async {
                    Err(CallError::Transport { message: "down".into() })
                })
                .await;
        }
    }

    #[tokio::test]
    async fn open_breaker_is_filtered_with_probe_escape() {
        let registry = ScriptedRegistry::new(vec![vec!["10.0.0.1:80", "10.0.0.2:80"]]);
        let instancer = Instancer::spawn(registry, "svc", vec![], true).await;
        let (metrics, breakers) = deps();
        let pool = EndpointPool::new(
            "src",
            "svc",
            &setting("/x", 100, 3),
            &instancer,
            metrics,
            breakers.clone(),
        )
        .unwrap();
        wait_for_targets(&pool, &["10.0.0.1:80", "10.0.0.2:80"]).await;

        // Force one breaker open through its own run path.
        force_open(&breakers, "src-svc-/x-GET-10.0.0.1:80", 3).await;
        assert_eq!(breakers.is_open("10.0.0.1:80-/x-GET"), Some(true));
        assert_eq!(breakers.is_open("10.0.0.2:80-/x-GET"), Some(false));

        let mut open_picks = 0;
        for _ in 0..400 {
            if pool.inner.resolve().unwrap().addr == "10.0.0.1:80" {
                open_picks += 1;
            }
        }
        // The open target is only reachable through the ~10% escape and then
        // an even draw against the healthy one: E ≈ 20 of 400.
        assert!(
            (2..=60).contains(&open_picks),
            "open target picked {} of 400",
            open_picks
        );
    }

    #[tokio::test]
    async fn all_open_falls_back_to_short_circuit_not_no_endpoint() {
        let registry = ScriptedRegistry::new(vec![vec!["10.0.0.1:80"]]);
        let instancer = Instancer::spawn(registry, "svc", vec![], true).await;
        let (metrics, breakers) = deps();
        let pool = EndpointPool::new(
            "src",
            "svc",
            &setting("/x", 100, 3),
            &instancer,
            metrics,
            breakers.clone(),
        )
        .unwrap();
        wait_for_targets(&pool, &["10.0.0.1:80"]).await;

        force_open(&breakers, "src-svc-/x-GET-10.0.0.1:80", 3).await;

        let err = pool.do_raw(&CallCtx::background(), RequestBody::empty()).await.unwrap_err();
        assert!(err.is_short_circuit(), "got {:?}", err);
    }

    #[tokio::test]
    async fn close_retires_all_targets_once() {
        let registry = ScriptedRegistry::new(vec![vec!["10.0.0.1:80", "10.0.0.2:80"]]);
        let instancer = Instancer::spawn(registry, "svc", vec![], true).await;
        let (metrics, breakers) = deps();
        let pool = EndpointPool::new(
            "src",
            "svc",
            &setting("/x", 100, 5),
            &instancer,
            metrics,
            breakers.clone(),
        )
        .unwrap();
        wait_for_targets(&pool, &["10.0.0.1:80", "10.0.0.2:80"]).await;

        pool.close();
        pool.close(); // idempotent
        assert!(pool.live_targets().is_empty());
        assert_eq!(breakers.snapshot().len(), 0);
    }

    #[tokio::test]
    async fn bad_method_is_a_config_error() {
        let instancer = Instancer::fixed("localhost:1");
        let (metrics, breakers) = deps();
        let mut bad = setting("/x", 100, 5);
        bad.method = "NOT A METHOD".into();
        let err = EndpointPool::new("src", "svc", &bad, &instancer, metrics, breakers)
            .err()
            .expect("must reject");
        assert_eq!(err.kind(), "config");
    }
}
