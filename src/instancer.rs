//! Discovery instancer: a per-service worker that long-polls the registry
//! and publishes instance snapshots.
//!
//! Publication goes through a `tokio::sync::watch` channel, which is a
//! single-slot overwrite mailbox: a late subscriber immediately observes the
//! latest snapshot, a slow subscriber may skip intermediate snapshots, and no
//! subscriber ever misses the final state. The tag map is additionally
//! exposed through an `ArcSwap` so hot call paths read it without locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::backoff::Backoff;
use crate::registry::{RegistryClient, RegistryEntry};
use crate::CallError;

/// Instance address to its latest tag sequence.
pub type TagMap = HashMap<String, Vec<String>>;

/// Immutable view of the current instance set.
///
/// A snapshot carrying an error keeps the last-known instance list so that a
/// registry outage does not erase working targets.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub instances: Vec<String>,
    pub tags: Arc<TagMap>,
    pub error: Option<String>,
}

/// Drives the registry adapter for one service and fans out snapshots.
#[derive(Debug)]
pub struct Instancer {
    service: String,
    rx: watch::Receiver<Snapshot>,
    tags: Arc<ArcSwap<TagMap>>,
    quit: Option<watch::Sender<bool>>,
    // Keeps the channel alive in fixed mode, where no worker holds the sender.
    _fixed_tx: Option<watch::Sender<Snapshot>>,
}

impl Instancer {
    /// Start a discovery worker for `service`.
    ///
    /// The initial poll (index 0) completes before this returns, so the first
    /// snapshot (possibly empty, possibly an error) is already observable.
    pub async fn spawn(
        client: Arc<dyn RegistryClient>,
        service: impl Into<String>,
        tags: Vec<String>,
        passing_only: bool,
    ) -> Self {
        let service = service.into();
        let tag_swap: Arc<ArcSwap<TagMap>> = Arc::new(ArcSwap::from_pointee(TagMap::new()));

        let (snapshot, index) = match poll(&*client, &service, &tags, passing_only, 0).await {
            Ok((instances, tag_map, index)) => {
                tracing::info!(service = %service, instances = instances.len(), "instancer ready");
                let tag_arc = Arc::new(tag_map);
                tag_swap.store(tag_arc.clone());
                (Snapshot { instances, tags: tag_arc, error: None }, index)
            }
            Err(err) => {
                tracing::warn!(service = %service, error = %err, "initial discovery poll failed");
                (
                    Snapshot {
                        instances: Vec::new(),
                        tags: Arc::new(TagMap::new()),
                        error: Some(err.to_string()),
                    },
                    0,
                )
            }
        };

        let (snap_tx, snap_rx) = watch::channel(snapshot.clone());
        let (quit_tx, quit_rx) = watch::channel(false);

        tokio::spawn(watch_loop(
            client,
            service.clone(),
            tags,
            passing_only,
            index,
            snapshot.instances,
            tag_swap.clone(),
            snap_tx,
            quit_rx,
        ));

        Self { service, rx: snap_rx, tags: tag_swap, quit: Some(quit_tx), _fixed_tx: None }
    }

    /// A single-instance set over a caller-provided host; no worker runs.
    pub fn fixed(host: impl Into<String>) -> Self {
        let host = host.into();
        let snapshot = Snapshot {
            instances: vec![host.clone()],
            tags: Arc::new(TagMap::new()),
            error: None,
        };
        let (tx, rx) = watch::channel(snapshot);
        Self {
            service: host,
            rx,
            tags: Arc::new(ArcSwap::from_pointee(TagMap::new())),
            quit: None,
            _fixed_tx: Some(tx),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Subscribe to snapshot updates. The receiver starts at the latest
    /// snapshot, never a stale one.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.rx.clone()
    }

    /// The latest published snapshot.
    pub fn latest(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    /// Lock-free handle to the current tag map.
    pub fn tag_map(&self) -> Arc<TagMap> {
        self.tags.load_full()
    }

    pub(crate) fn tag_swap(&self) -> Arc<ArcSwap<TagMap>> {
        self.tags.clone()
    }

    /// Terminate the worker; the in-flight poll is abandoned and no further
    /// snapshots are published.
    pub fn stop(&self) {
        if let Some(quit) = &self.quit {
            let _ = quit.send(true);
        }
    }
}

impl Drop for Instancer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    client: Arc<dyn RegistryClient>,
    service: String,
    tags: Vec<String>,
    passing_only: bool,
    mut last_index: u64,
    mut last_good: Vec<String>,
    tag_swap: Arc<ArcSwap<TagMap>>,
    snap_tx: watch::Sender<Snapshot>,
    mut quit_rx: watch::Receiver<bool>,
) {
    let backoff = Backoff::exponential(Duration::from_millis(10)).with_max(Duration::from_secs(10));
    let mut attempt = 1usize;

    loop {
        let result = tokio::select! {
            _ = quit_rx.changed() => {
                tracing::info!(service = %service, "instancer stopped");
                return;
            }
            res = poll(&*client, &service, &tags, passing_only, last_index) => res,
        };

        match result {
            Ok((instances, tag_map, index)) => {
                last_index = index;
                attempt = 1;
                let tag_arc = Arc::new(tag_map);
                tag_swap.store(tag_arc.clone());
                last_good = instances.clone();
                tracing::debug!(service = %service, instances = instances.len(), index, "discovery update");
                let _ = snap_tx.send(Snapshot { instances, tags: tag_arc, error: None });
            }
            Err(err) => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                tracing::warn!(service = %service, error = %err, ?delay, "discovery poll failed");
                let _ = snap_tx.send(Snapshot {
                    instances: last_good.clone(),
                    tags: tag_swap.load_full(),
                    error: Some(err.to_string()),
                });
                tokio::select! {
                    _ = quit_rx.changed() => {
                        tracing::info!(service = %service, "instancer stopped");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn poll(
    client: &dyn RegistryClient,
    service: &str,
    tags: &[String],
    passing_only: bool,
    last_index: u64,
) -> Result<(Vec<String>, TagMap, u64), CallError> {
    // The registry's native query takes at most one tag; the rest are
    // filtered here after receipt.
    let first = tags.first().map(String::as_str);
    let (mut entries, index) = client.query(service, first, passing_only, last_index).await?;
    if tags.len() > 1 {
        entries = filter_entries(entries, &tags[1..]);
    }

    let mut instances = Vec::with_capacity(entries.len());
    let mut tag_map = TagMap::with_capacity(entries.len());
    for entry in entries {
        let instance = entry.instance();
        tag_map.insert(instance.clone(), entry.tags);
        instances.push(instance);
    }
    Ok((instances, tag_map, index))
}

fn filter_entries(entries: Vec<RegistryEntry>, required: &[String]) -> Vec<RegistryEntry> {
    entries
        .into_iter()
        .filter(|entry| required.iter().all(|tag| entry.tags.contains(tag)))
        .collect()
}
