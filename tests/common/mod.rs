//! Shared helpers for integration tests: a local stub upstream, a scripted
//! registry, and context construction.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::routing::{get, post};
use axum::{Json, Router};
use dialkit::{
    CallError, ClientContext, EndpointSetting, RegistryClient, RegistryEntry, SdConfig,
    SettingProvider,
};

/// Spin up a stub upstream on a random loopback port and return its address.
///
/// Routes: `GET /good` (200 JSON), `GET /who` (the given name), `POST /echo`
/// (body passthrough), `GET /badjson` (non-JSON text), `GET /slow` (120 ms
/// then 200 JSON); everything else 404s.
pub async fn stub_server(name: &'static str) -> String {
    let app = Router::new()
        .route("/good", get(|| async { Json(serde_json::json!({"ok": true})) }))
        .route("/who", get(move || async move { name }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .route("/badjson", get(|| async { "not-json" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(120)).await;
                Json(serde_json::json!({"ok": true}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });
    format!("127.0.0.1:{}", addr.port())
}

/// Registry fake that replays a fixed script of poll results, then blocks
/// like a long-poll with no further changes.
pub struct ScriptedRegistry {
    steps: tokio::sync::Mutex<VecDeque<Result<Vec<RegistryEntry>, String>>>,
}

impl ScriptedRegistry {
    pub fn new(steps: Vec<Result<Vec<(&str, Vec<&str>)>, &str>>) -> Arc<Self> {
        let steps = steps
            .into_iter()
            .map(|step| {
                step.map(|entries| entries.into_iter().map(|(a, t)| entry(a, &t)).collect())
                    .map_err(|e| e.to_string())
            })
            .collect();
        Arc::new(Self { steps: tokio::sync::Mutex::new(steps) })
    }
}

fn entry(addr: &str, tags: &[&str]) -> RegistryEntry {
    let (host, port) = addr.split_once(':').expect("addr must be host:port");
    RegistryEntry {
        address: host.to_string(),
        port: port.parse().expect("numeric port"),
        tags: tags.iter().map(|t| t.to_string()).collect(),
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
            Some(Ok(entries)) => Ok((entries, last_index + 1)),
            Some(Err(message)) => Err(CallError::Transport { message }),
            None => futures::future::pending().await,
        }
    }
}

/// Provider handing the same settings to every target host.
pub struct MapProvider {
    settings: Vec<EndpointSetting>,
}

impl MapProvider {
    pub fn new(settings: Vec<EndpointSetting>) -> Arc<Self> {
        Arc::new(Self { settings })
    }
}

impl SettingProvider for MapProvider {
    fn get_settings(&self, _target: &str) -> HashMap<String, EndpointSetting> {
        self.settings.iter().map(|s| (s.key(), s.clone())).collect()
    }
}

/// Context for direct-mode clients with the given provider settings.
pub fn direct_ctx(settings: Vec<EndpointSetting>) -> Arc<ClientContext> {
    ClientContext::builder()
        .source("itest")
        .sd_config(SdConfig::None)
        .setting_provider(MapProvider::new(settings))
        .build()
        .expect("context")
}

/// Context wired to a scripted registry for discovery-mode clients.
pub fn sd_ctx(
    registry: Arc<ScriptedRegistry>,
    settings: Vec<EndpointSetting>,
) -> Arc<ClientContext> {
    ClientContext::builder()
        .source("itest")
        .sd_config(SdConfig::Consul { address: "unused:8500".into(), datacenter: "dc1".into() })
        .registry_client(registry)
        .setting_provider(MapProvider::new(settings))
        .build()
        .expect("context")
}

/// Gather a counter value by family name and label subset.
pub fn counter_value(
    registry: &prometheus::Registry,
    family: &str,
    wanted: &[(&str, &str)],
) -> Option<f64> {
    for mf in registry.gather() {
        if mf.get_name() != family {
            continue;
        }
        for metric in mf.get_metric() {
            let labels: Vec<(&str, &str)> =
                metric.get_label().iter().map(|l| (l.get_name(), l.get_value())).collect();
            if wanted.iter().all(|pair| labels.contains(pair)) {
                return Some(metric.get_counter().value());
            }
        }
    }
    None
}
