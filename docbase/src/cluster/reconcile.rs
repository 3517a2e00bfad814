//! Topology reconciliation: reshaping the registry and a bucket's node view
//! against an incoming cluster map.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::bucket::BucketAttachment;
use crate::cluster::config::ClusterMap;
use crate::cluster::node::BucketKind;
use crate::cluster::registry::NodeRegistry;
use crate::errors::ConnectError;
use crate::network::{with_cancel, ClusterNodeFactory};

/// Everything a reconciliation pass needs from the core.
pub(crate) struct ReconcileCtx<'a> {
    pub(crate) registry: &'a NodeRegistry,
    pub(crate) factory: &'a dyn ClusterNodeFactory,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) tls: bool,
}

/// Applies `map` to `bucket`: claims or creates a node per adapter, then
/// prunes registry entries whose host the map no longer names.
///
/// Failures on a single node are logged and leave that node out of the
/// resulting view; they never abort the whole application. New endpoints are
/// connected and registered before anything is pruned, so concurrent lookups
/// never observe an empty interim topology.
pub(crate) async fn apply(ctx: &ReconcileCtx<'_>, bucket: &BucketAttachment, map: &ClusterMap) {
    debug!(
        bucket = bucket.name(),
        rev = map.rev,
        nodes = map.nodes.len(),
        "Applying cluster map"
    );

    for adapter in &map.nodes {
        let endpoint = adapter.endpoint(map.network, ctx.tls);

        if let Some(node) = ctx.registry.try_get(&endpoint) {
            if node.is_unassigned() && bucket.kind() != BucketKind::Memcached {
                if node.capabilities().kv {
                    if let Err(err) =
                        with_cancel(ctx.cancel, node.select_bucket(bucket.name())).await
                    {
                        warn!(
                            bucket = bucket.name(),
                            node = %endpoint,
                            error = %err,
                            "Select-bucket failed during reconciliation; node left out of the view"
                        );
                        continue;
                    }
                } else {
                    node.refresh_capabilities();
                }
                node.try_claim(bucket.name());
                node.set_adapter(adapter.clone());
                bucket.add_to_view(node);
            } else if !node.is_unassigned() && node.kind == BucketKind::Memcached {
                // Memcached nodes are shared by endpoint across buckets.
                node.set_adapter(adapter.clone());
                bucket.add_to_view(node);
            } else if bucket.view_contains(&node) {
                node.set_adapter(adapter.clone());
            }
            continue;
        }

        match with_cancel(
            ctx.cancel,
            ctx.factory
                .create_and_connect(&endpoint, bucket.kind(), Some(adapter.clone()), ctx.cancel),
        )
        .await
        {
            Ok(node) => {
                if bucket.kind() == BucketKind::Couchbase && node.capabilities().kv {
                    if let Err(err) =
                        with_cancel(ctx.cancel, node.select_bucket(bucket.name())).await
                    {
                        warn!(
                            bucket = bucket.name(),
                            node = %endpoint,
                            error = %err,
                            "Select-bucket failed on a freshly connected node"
                        );
                        node.dispose();
                        continue;
                    }
                }
                node.try_claim(bucket.name());
                if ctx.registry.add(Arc::clone(&node)) {
                    bucket.add_to_view(node);
                } else {
                    // Another writer registered this endpoint while we were
                    // connecting; keep theirs.
                    node.dispose();
                }
            }
            Err(ConnectError::Cancelled) => {
                debug!(bucket = bucket.name(), "Reconciliation cancelled");
                return;
            }
            Err(err) => {
                warn!(
                    bucket = bucket.name(),
                    node = %endpoint,
                    error = %err,
                    "Failed to connect a node named by the cluster map"
                );
            }
        }
    }

    prune(ctx, Some(bucket), map);
}

/// Applies a global (bucket-less) map: refreshes the adapter of every known
/// node, connects and registers the ones the map newly lists, then prunes the
/// rest. Ownership is untouched; buckets claim nodes through their own maps.
pub(crate) async fn apply_global(ctx: &ReconcileCtx<'_>, map: &ClusterMap) {
    debug!(
        rev = map.rev,
        nodes = map.nodes.len(),
        "Applying global cluster map"
    );

    for adapter in &map.nodes {
        let endpoint = adapter.endpoint(map.network, ctx.tls);

        if let Some(node) = ctx.registry.try_get(&endpoint) {
            node.set_adapter(adapter.clone());
            continue;
        }

        match with_cancel(
            ctx.cancel,
            ctx.factory.create_and_connect(
                &endpoint,
                BucketKind::Couchbase,
                Some(adapter.clone()),
                ctx.cancel,
            ),
        )
        .await
        {
            Ok(node) => {
                if !ctx.registry.add(Arc::clone(&node)) {
                    node.dispose();
                }
            }
            Err(ConnectError::Cancelled) => {
                debug!("Global reconciliation cancelled");
                return;
            }
            Err(err) => {
                warn!(
                    node = %endpoint,
                    error = %err,
                    "Failed to connect a node named by the global map"
                );
            }
        }
    }

    prune(ctx, None, map);
}

/// Removes and disposes every registry entry whose host is absent from the
/// map. Membership is compared on host only: alternate-address ports move
/// across revisions while the node itself stays put.
fn prune(ctx: &ReconcileCtx<'_>, view: Option<&BucketAttachment>, map: &ClusterMap) {
    let hosts = map.host_set();
    for node in ctx.registry.snapshot() {
        if hosts.contains(node.endpoint.host()) {
            continue;
        }
        if let Some(removed) = ctx.registry.remove(&node.endpoint) {
            debug!(
                node = %removed.endpoint,
                "Pruning node absent from the new cluster map"
            );
            if let Some(bucket) = view {
                bucket.drop_from_view(&removed.endpoint);
            }
            removed.dispose();
        }
    }
}
