//! Per-bucket attachment state and the bucket factory seam.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::config::ClusterMap;
use crate::cluster::node::{BucketKind, Endpoint, NodeHandle, NodeRef};
use crate::cluster::reconcile::{self, ReconcileCtx};
use crate::errors::ConnectError;

/// The in-process state of one opened bucket.
///
/// Created by a [`BucketFactory`] on the first user request for the name and
/// registered with the core only after one bootstrap succeeded. Holds an
/// ordered view of the node handles currently assigned to the bucket and the
/// revision of the last applied cluster map.
pub struct BucketAttachment {
    name: String,
    kind: BucketKind,
    nodes: RwLock<Vec<Arc<NodeHandle>>>,
    bootstrapped: AtomicBool,
    // 0 means "no revision applied in this config epoch"; server revisions
    // start at 1.
    last_rev: AtomicU64,
    apply_lock: Mutex<()>,
}

impl BucketAttachment {
    /// Creates a fresh, un-bootstrapped attachment.
    pub fn new(name: impl Into<String>, kind: BucketKind) -> Arc<Self> {
        Arc::new(BucketAttachment {
            name: name.into(),
            kind,
            nodes: RwLock::new(Vec::new()),
            bootstrapped: AtomicBool::new(false),
            last_rev: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        })
    }

    /// Name of the bucket.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the bucket.
    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    /// Whether at least one attach handshake completed successfully.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Revision of the last applied cluster map, if any was applied in the
    /// current config epoch.
    pub fn last_applied_rev(&self) -> Option<u64> {
        match self.last_rev.load(Ordering::Acquire) {
            0 => None,
            rev => Some(rev),
        }
    }

    /// The bucket's current node view. Handles disposed by a concurrent
    /// reconciliation are filtered out.
    pub fn nodes(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .filter(|node| !node.is_disposed())
            .cloned()
            .collect()
    }

    pub(crate) fn view_contains(&self, node: &NodeHandle) -> bool {
        self.nodes.read().unwrap().iter().any(|n| n.id == node.id)
    }

    pub(crate) fn add_to_view(&self, node: Arc<NodeHandle>) {
        let mut view = self.nodes.write().unwrap();
        if !view.iter().any(|n| n.id == node.id) {
            view.push(node);
        }
    }

    pub(crate) fn drop_from_view(&self, endpoint: &Endpoint) {
        self.nodes
            .write()
            .unwrap()
            .retain(|node| node.endpoint != *endpoint);
    }

    /// Drains the node view, e.g. ahead of a rebootstrap. Removal from the
    /// registry and disposal stay with the caller.
    pub(crate) fn clear_view(&self) -> Vec<Arc<NodeHandle>> {
        std::mem::take(&mut *self.nodes.write().unwrap())
    }

    /// Performs the bucket handshake on `seed` and pulls the first per-bucket
    /// cluster map.
    ///
    /// Couchbase buckets select themselves on the seed's key/value connection
    /// first; Memcached buckets have no handshake. Any error short-circuits,
    /// including `RateLimited`, which the caller must never absorb. On
    /// success the seed is claimed for this bucket, registered, and the map
    /// is applied as the start of a fresh config epoch.
    pub(crate) async fn attach(
        &self,
        seed: NodeRef<'_>,
        ctx: &ReconcileCtx<'_>,
    ) -> Result<(), ConnectError> {
        if self.kind == BucketKind::Couchbase && seed.capabilities().kv {
            crate::network::with_cancel(ctx.cancel, seed.select_bucket(&self.name)).await?;
        }
        let map =
            crate::network::with_cancel(ctx.cancel, seed.fetch_bucket_map(&self.name)).await?;

        // The seed only joins the view if it is the registry's handle for its
        // endpoint; a raced duplicate served the handshake and nothing more.
        let registered = ctx.registry.add(Arc::clone(seed))
            || ctx
                .registry
                .try_get(&seed.endpoint)
                .is_some_and(|node| node.id == seed.id);
        if registered {
            seed.try_claim(&self.name);
            self.add_to_view(Arc::clone(seed));
        }

        // A fresh attach starts a new config epoch; the first map is admitted
        // regardless of the revision applied before the nodes were lost.
        self.last_rev.store(0, Ordering::Release);
        self.apply_config(&map, ctx).await;
        self.bootstrapped.store(true, Ordering::Release);
        Ok(())
    }

    /// Applies a cluster map to this bucket.
    ///
    /// Applications are serialized per bucket; a revision not strictly newer
    /// than the last applied one in this epoch is discarded.
    pub(crate) async fn apply_config(&self, map: &ClusterMap, ctx: &ReconcileCtx<'_>) {
        let _permit = self.apply_lock.lock().await;
        if !self.admits(map.rev) {
            debug!(
                bucket = %self.name,
                rev = map.rev,
                last = self.last_rev.load(Ordering::Acquire),
                "Discarding stale cluster map revision"
            );
            return;
        }
        reconcile::apply(ctx, self, map).await;
        self.last_rev.store(map.rev, Ordering::Release);
    }

    fn admits(&self, rev: u64) -> bool {
        let last = self.last_rev.load(Ordering::Acquire);
        last == 0 || rev > last
    }

    /// Marks the attachment dead and drains its view. The caller removes the
    /// drained nodes from the registry and disposes them.
    pub(crate) fn dispose(&self) -> Vec<Arc<NodeHandle>> {
        self.bootstrapped.store(false, Ordering::Release);
        self.clear_view()
    }
}

impl std::fmt::Debug for BucketAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketAttachment")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bootstrapped", &self.is_bootstrapped())
            .field("last_rev", &self.last_applied_rev())
            .field("nodes", &self.nodes.read().unwrap().len())
            .finish()
    }
}

/// Creates bucket attachments. A seam so embedders (and tests) can observe
/// or decorate attachment creation.
pub trait BucketFactory: Send + Sync {
    /// Creates an attachment for `name` of `kind`.
    fn create(&self, name: &str, kind: BucketKind) -> Arc<BucketAttachment>;
}

/// The default factory: plain attachments, nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdBucketFactory;

impl BucketFactory for StdBucketFactory {
    fn create(&self, name: &str, kind: BucketKind) -> Arc<BucketAttachment> {
        BucketAttachment::new(name, kind)
    }
}
