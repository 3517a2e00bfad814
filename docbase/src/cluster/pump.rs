//! Fan-out of cluster map updates to the core and per-bucket sinks.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cluster::bucket::BucketAttachment;
use crate::cluster::config::ClusterMap;
use crate::cluster::core::CoreInner;
use crate::network::with_cancel;
use crate::service::ServiceType;

/// How often the poller asks a node for a fresh map, when polling is enabled.
/// Matches the interval servers expect from in-band config polling clients.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(2500);

/// Publish/subscribe facade over heterogeneous config sources.
///
/// Sources (server pushes, pollers, embedder calls through
/// [`ClusterCore::publish_config`](crate::cluster::core::ClusterCore::publish_config))
/// feed maps into an unbounded queue; a single drain task dispatches them,
/// which serializes deliveries per bucket. Global maps update the core's
/// global config slot; bucket maps go to the matching subscription, where the
/// attachment's revision gate discards anything not strictly newer.
pub(crate) struct ConfigPump {
    subscriptions: Arc<DashMap<String, Arc<BucketAttachment>>>,
    tx: mpsc::UnboundedSender<ClusterMap>,
    rx: StdMutex<Option<mpsc::UnboundedReceiver<ClusterMap>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConfigPump {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ConfigPump {
            subscriptions: Arc::new(DashMap::new()),
            tx,
            rx: StdMutex::new(Some(rx)),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Registers a per-bucket sink.
    pub(crate) fn subscribe(&self, attachment: Arc<BucketAttachment>) {
        self.subscriptions
            .insert(attachment.name().to_owned(), attachment);
    }

    /// Removes the sink for `bucket`, if any.
    pub(crate) fn unsubscribe(&self, bucket: &str) {
        self.subscriptions.remove(bucket);
    }

    /// The sink registered for `bucket`, if any.
    pub(crate) fn subscription(&self, bucket: &str) -> Option<Arc<BucketAttachment>> {
        self.subscriptions
            .get(bucket)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Enqueues a map for delivery. Maps published before [`ConfigPump::start`]
    /// are held until the drain task comes up.
    pub(crate) fn publish(&self, map: ClusterMap) {
        let _ = self.tx.send(map);
    }

    /// Spawns the drain task and, when asked, the poller. Idempotent: a
    /// second call finds the receiver taken and does nothing.
    pub(crate) fn start(
        &self,
        core: Weak<CoreInner>,
        cancel: CancellationToken,
        enable_polling: bool,
    ) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };

        let drain_core = Weak::clone(&core);
        let drain_cancel = cancel.clone();
        let drain = tokio::spawn(async move {
            loop {
                let map = tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(map) => map,
                        None => break,
                    },
                };
                let Some(inner) = drain_core.upgrade() else {
                    break;
                };
                inner.deliver(map).await;
            }
            debug!("Config pump drain task exited");
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(drain);

        if enable_polling {
            let subscriptions = Arc::clone(&self.subscriptions);
            let tx = self.tx.clone();
            let poller = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(inner) = core.upgrade() else {
                        break;
                    };
                    let buckets: Vec<Arc<BucketAttachment>> = subscriptions
                        .iter()
                        .map(|entry| Arc::clone(entry.value()))
                        .collect();
                    let fetched = join_all(buckets.iter().map(|bucket| {
                        let inner = Arc::clone(&inner);
                        let cancel = cancel.clone();
                        async move { poll_one(&inner, bucket, &cancel).await }
                    }))
                    .await;
                    for map in fetched.into_iter().flatten() {
                        let _ = tx.send(map);
                    }
                }
                debug!("Config poller exited");
            });
            tasks.push(poller);
        }
    }

    /// Aborts the pump's tasks and drops every subscription.
    pub(crate) fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.subscriptions.clear();
    }
}

/// One polling round for one bucket: pick a key/value node, preferably one
/// the bucket owns, and ask it for a fresh map.
async fn poll_one(
    inner: &CoreInner,
    bucket: &BucketAttachment,
    cancel: &CancellationToken,
) -> Option<ClusterMap> {
    let name = bucket.name();
    let node = inner
        .registry
        .random(|n| n.capabilities().supports(ServiceType::KeyValue) && n.owner() == Some(name))
        .or_else(|| {
            inner
                .registry
                .random(|n| n.capabilities().supports(ServiceType::KeyValue))
        })?;

    match with_cancel(cancel, node.fetch_bucket_map(name)).await {
        Ok(map) => {
            trace!(bucket = name, rev = map.rev, "Polled cluster map");
            Some(map)
        }
        Err(err) => {
            debug!(bucket = name, node = %node.endpoint, error = %err, "Config poll failed");
            None
        }
    }
}
