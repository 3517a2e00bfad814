//! The process-wide cluster coordination core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::connection_string::ConnectionString;
use crate::client::options::ClusterOptions;
use crate::cluster::bucket::{BucketAttachment, BucketFactory};
use crate::cluster::config::ClusterMap;
use crate::cluster::node::{BucketKind, Endpoint, NodeHandle};
use crate::cluster::pump::ConfigPump;
use crate::cluster::reconcile::{self, ReconcileCtx};
use crate::cluster::registry::NodeRegistry;
use crate::cluster::selector;
use crate::errors::{
    BootstrapError, ConnectError, DisposedError, OpenBucketError, SelectionError,
};
use crate::network::{with_cancel, ClusterNodeFactory, DnsResolver};
use crate::observability::{LoggingTraceListener, RequestTracer, TraceListener};
use crate::service::ServiceType;

/// The collaborators a core is constructed over.
///
/// Everything that suspends lives behind one of these seams; the core itself
/// never opens a socket or resolves a name.
#[derive(Clone)]
pub struct Services {
    /// The only way node handles are born.
    pub node_factory: Arc<dyn ClusterNodeFactory>,
    /// DNS-SRV resolution for seed discovery.
    pub dns_resolver: Arc<dyn DnsResolver>,
    /// Creates per-bucket attachments.
    pub bucket_factory: Arc<dyn BucketFactory>,
    /// Optional tracing subsystem; listeners started through it are owned by
    /// the core and disposed with it.
    pub tracer: Option<Arc<dyn RequestTracer>>,
}

impl Services {
    /// Bundles the two mandatory collaborators with a default bucket factory
    /// and no tracer.
    pub fn new(
        node_factory: Arc<dyn ClusterNodeFactory>,
        dns_resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Services {
            node_factory,
            dns_resolver,
            bucket_factory: Arc::new(crate::cluster::bucket::StdBucketFactory),
            tracer: None,
        }
    }

    /// Replaces the bucket factory.
    pub fn with_bucket_factory(mut self, bucket_factory: Arc<dyn BucketFactory>) -> Self {
        self.bucket_factory = bucket_factory;
        self
    }

    /// Installs a request tracer.
    pub fn with_tracer(mut self, tracer: Arc<dyn RequestTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

pub(crate) struct CoreInner {
    options: ClusterOptions,
    services: Services,
    pub(crate) registry: NodeRegistry,
    buckets: DashMap<String, Arc<BucketAttachment>>,
    global_config: ArcSwapOption<ClusterMap>,
    supports_collections: AtomicBool,
    supports_preserve_ttl: AtomicBool,
    attach_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    pump: ConfigPump,
    seeds: RwLock<Vec<Endpoint>>,
    srv_host: Option<String>,
    tls: bool,
    started: AtomicBool,
    disposed: AtomicBool,
    trace_listeners: StdMutex<Vec<Arc<dyn TraceListener>>>,
}

impl CoreInner {
    pub(crate) fn reconcile_ctx(&self) -> ReconcileCtx<'_> {
        ReconcileCtx {
            registry: &self.registry,
            factory: self.services.node_factory.as_ref(),
            cancel: &self.cancel,
            tls: self.tls,
        }
    }

    /// Delivery point of the config pump's drain task.
    pub(crate) async fn deliver(&self, map: ClusterMap) {
        if let Some(name) = map.bucket.clone() {
            let Some(attachment) = self.pump.subscription(&name) else {
                debug!(bucket = %name, "Dropping cluster map for an unsubscribed bucket");
                return;
            };
            let ctx = self.reconcile_ctx();
            attachment.apply_config(&map, &ctx).await;
        } else if map.is_global {
            if !self.admits_global(map.rev) {
                debug!(rev = map.rev, "Discarding stale global map");
                return;
            }
            let ctx = self.reconcile_ctx();
            reconcile::apply_global(&ctx, &map).await;
            self.store_global(map);
        }
    }

    fn admits_global(&self, rev: u64) -> bool {
        self.global_config
            .load_full()
            .map_or(true, |current| rev > current.rev)
    }

    /// Stores a global map unless one with an equal or newer revision is
    /// already held.
    fn store_global(&self, map: ClusterMap) {
        if let Some(current) = self.global_config.load_full() {
            if map.rev <= current.rev {
                debug!(rev = map.rev, held = current.rev, "Discarding stale global map");
                return;
            }
        }
        self.global_config.store(Some(Arc::new(map)));
    }

    /// Captures the feature flags of a freshly connected node. Within one
    /// config epoch the last connected node wins.
    fn note_connected(&self, node: &NodeHandle) {
        let caps = node.capabilities();
        self.supports_collections
            .store(caps.collections, Ordering::Release);
        self.supports_preserve_ttl
            .store(caps.preserve_ttl, Ordering::Release);
    }

    /// Reuses an unassigned node at `endpoint` for `kind`, or dials a fresh
    /// one and registers it.
    async fn node_for_attach(
        &self,
        endpoint: &Endpoint,
        kind: BucketKind,
    ) -> Result<Arc<NodeHandle>, ConnectError> {
        if let Some(node) = self.registry.first_unassigned(endpoint, kind) {
            return Ok(node);
        }
        let node = with_cancel(
            &self.cancel,
            self.services
                .node_factory
                .create_and_connect(endpoint, kind, None, &self.cancel),
        )
        .await?;
        // In the rare case the endpoint got occupied while dialing, the fresh
        // handle stays unregistered and only serves this handshake.
        self.registry.add(Arc::clone(&node));
        Ok(node)
    }

    fn register_attachment(&self, attachment: Arc<BucketAttachment>) {
        self.pump.subscribe(Arc::clone(&attachment));
        self.buckets
            .insert(attachment.name().to_owned(), attachment);
    }

    fn unregister_attachment(&self, name: &str) -> Option<Arc<BucketAttachment>> {
        self.pump.unsubscribe(name);
        self.buckets.remove(name).map(|(_, attachment)| attachment)
    }

    fn ensure_live(&self) -> Result<(), DisposedError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(DisposedError)
        } else {
            Ok(())
        }
    }
}

/// Owns the node registry, the bucket attachments, bootstrap, and topology
/// reconciliation for one cluster.
///
/// The core is process-scoped but not a singleton: every instance is an
/// independent value whose lifetime the caller owns. Request-issuing tasks
/// read the registry concurrently with bootstrap and config-pump writers.
///
/// Dropping the core disposes it.
pub struct ClusterCore {
    inner: Arc<CoreInner>,
}

impl ClusterCore {
    /// Builds a core from options and collaborators. Fails when the
    /// connection string yields no endpoints.
    pub fn new(options: ClusterOptions, services: Services) -> Result<Self, BootstrapError> {
        let conn_str = ConnectionString::parse(&options.connection_string)?;
        let tls = conn_str.is_tls() || options.enable_tls;
        let seeds = conn_str.endpoints(tls);
        let srv_host = conn_str.srv_candidate().map(ToOwned::to_owned);

        Ok(ClusterCore {
            inner: Arc::new(CoreInner {
                options,
                services,
                registry: NodeRegistry::new(),
                buckets: DashMap::new(),
                global_config: ArcSwapOption::from(None),
                supports_collections: AtomicBool::new(false),
                supports_preserve_ttl: AtomicBool::new(false),
                attach_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                pump: ConfigPump::new(),
                seeds: RwLock::new(seeds),
                srv_host,
                tls,
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                trace_listeners: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Starts the config pump and the configured tracing listeners.
    /// Idempotent.
    pub fn start(&self) -> Result<(), DisposedError> {
        self.inner.ensure_live()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(tracer) = &self.inner.services.tracer {
            let mut owned = self.inner.trace_listeners.lock().unwrap();
            for (options, scope) in [
                (&self.inner.options.threshold_tracing, "threshold"),
                (&self.inner.options.orphan_tracing, "orphan"),
            ] {
                if !options.enabled {
                    continue;
                }
                let listener = options
                    .listener
                    .clone()
                    .unwrap_or_else(|| Arc::new(LoggingTraceListener::new(scope)));
                tracer.start(Arc::clone(&listener));
                owned.push(listener);
            }
        }

        self.inner.pump.start(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            self.inner.options.enable_config_polling,
        );
        Ok(())
    }

    /// Discovers the cluster through a bucket-less bootstrap.
    ///
    /// Seed endpoints come from DNS-SRV when the connection string is a
    /// candidate (resolution failure is non-fatal), otherwise from the
    /// literal endpoint list, and are attempted in order. The first seed that
    /// yields a global map wins; every node the map names is connected and
    /// registered. A server without global config support leaves the core in
    /// legacy mode: only the seed is registered and bucket opens drive
    /// further discovery.
    pub async fn bootstrap_global(&self) -> Result<(), BootstrapError> {
        self.inner.ensure_live()?;
        let seeds = self.resolve_seeds().await;
        let cancel = &self.inner.cancel;
        let mut last_err = None;

        for endpoint in &seeds {
            let node = match with_cancel(
                cancel,
                self.inner.services.node_factory.create_and_connect(
                    endpoint,
                    BucketKind::Couchbase,
                    None,
                    cancel,
                ),
            )
            .await
            {
                Ok(node) => node,
                Err(ConnectError::RateLimited) => return Err(BootstrapError::RateLimited),
                Err(ConnectError::Cancelled) => return Err(BootstrapError::Cancelled),
                Err(err) => {
                    warn!(seed = %endpoint, error = %err, "Seed connect failed; trying next");
                    last_err = Some(err);
                    continue;
                }
            };

            match with_cancel(cancel, node.fetch_global_map()).await {
                Ok(mut map) => {
                    map.is_global = true;
                    map.bucket = None;
                    self.apply_global_bootstrap(&node, endpoint, &map).await?;
                    self.inner.store_global(map);
                    return Ok(());
                }
                Err(ConnectError::BucketNotConnected) => {
                    // Pre-global-config server: keep the seed and let bucket
                    // opens discover the rest of the cluster.
                    debug!(seed = %endpoint, "Global config unsupported; running in legacy mode");
                    self.inner.note_connected(&node);
                    if !self.inner.registry.add(Arc::clone(&node)) {
                        node.dispose();
                    }
                    return Ok(());
                }
                Err(ConnectError::RateLimited) => {
                    node.dispose();
                    return Err(BootstrapError::RateLimited);
                }
                Err(ConnectError::Cancelled) => {
                    node.dispose();
                    return Err(BootstrapError::Cancelled);
                }
                Err(err) => {
                    warn!(seed = %endpoint, error = %err, "Global map fetch failed; trying next");
                    node.dispose();
                    last_err = Some(err);
                }
            }
        }

        warn!(
            seeds = %seeds.iter().join(", "),
            "Bootstrap exhausted every seed endpoint"
        );
        Err(BootstrapError::NoNodesReachable {
            attempts: seeds.len(),
            last: last_err
                .unwrap_or_else(|| ConnectError::Protocol("no seed endpoints".to_owned())),
        })
    }

    /// Registers the seed under its map adapter and connects every other
    /// node the global map names. Per-node connect failures are absorbed.
    async fn apply_global_bootstrap(
        &self,
        seed: &Arc<NodeHandle>,
        seed_endpoint: &Endpoint,
        map: &ClusterMap,
    ) -> Result<(), BootstrapError> {
        let inner = &self.inner;
        for adapter in &map.nodes {
            let endpoint = adapter.endpoint(map.network, inner.tls);
            if endpoint == *seed_endpoint {
                seed.set_adapter(adapter.clone());
                inner.note_connected(seed);
                inner.registry.add(Arc::clone(seed));
                continue;
            }
            match with_cancel(
                &inner.cancel,
                inner.services.node_factory.create_and_connect(
                    &endpoint,
                    BucketKind::Couchbase,
                    Some(adapter.clone()),
                    &inner.cancel,
                ),
            )
            .await
            {
                Ok(peer) => {
                    inner.note_connected(&peer);
                    if !inner.registry.add(Arc::clone(&peer)) {
                        peer.dispose();
                    }
                }
                Err(ConnectError::Cancelled) => return Err(BootstrapError::Cancelled),
                Err(err) => {
                    warn!(node = %endpoint, error = %err, "Failed to connect a node from the global map");
                }
            }
        }
        Ok(())
    }

    /// Substitutes DNS-SRV records for the seed list when the connection
    /// string is an SRV candidate. Failures and empty answers fall through
    /// to the literal endpoints.
    async fn resolve_seeds(&self) -> Vec<Endpoint> {
        let inner = &self.inner;
        if let Some(host) = &inner.srv_host {
            match inner
                .services
                .dns_resolver
                .resolve_srv(host, &inner.cancel)
                .await
            {
                Ok(found) if !found.is_empty() => {
                    let resolved: Vec<Endpoint> = found
                        .into_iter()
                        .map(|ep| Endpoint::new(ep.host().to_owned(), ep.port(), inner.tls))
                        .collect();
                    *inner.seeds.write().unwrap() = resolved.clone();
                    return resolved;
                }
                Ok(_) => debug!(host = %host, "DNS-SRV returned no records; using literal endpoints"),
                Err(err) => {
                    warn!(host = %host, error = %err, "DNS-SRV resolution failed; using literal endpoints");
                }
            }
        }
        inner.seeds.read().unwrap().clone()
    }

    /// Returns the attachment for `name`, attaching the bucket first if this
    /// is the first request for it.
    ///
    /// At most one attach sequence is in flight across all bucket names;
    /// concurrent callers for the same name all receive the attachment the
    /// winner produced. Seed endpoints are tried in order, each with every
    /// bucket kind in [`BucketKind::ATTACH_ORDER`]. `RateLimited` aborts the
    /// sweep immediately.
    pub async fn get_or_create_bucket(
        &self,
        name: &str,
    ) -> Result<Arc<BucketAttachment>, OpenBucketError> {
        self.inner.ensure_live()?;
        if let Some(existing) = self.inner.buckets.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let _permit = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(OpenBucketError::Cancelled),
            permit = self.inner.attach_lock.lock() => permit,
        };
        // Another waiter may have finished the attach while we queued.
        if let Some(existing) = self.inner.buckets.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let seeds = self.inner.seeds.read().unwrap().clone();
        for endpoint in &seeds {
            for kind in BucketKind::ATTACH_ORDER {
                let node = match self.inner.node_for_attach(endpoint, kind).await {
                    Ok(node) => node,
                    Err(ConnectError::RateLimited) => return Err(OpenBucketError::RateLimited),
                    Err(ConnectError::Cancelled) => return Err(OpenBucketError::Cancelled),
                    Err(err) => {
                        warn!(bucket = name, seed = %endpoint, %kind, error = %err, "Attach seed connect failed");
                        continue;
                    }
                };

                let attachment = self.inner.services.bucket_factory.create(name, kind);
                let ctx = self.inner.reconcile_ctx();
                match attachment.attach(&node, &ctx).await {
                    Ok(()) => {
                        self.inner.note_connected(&node);
                        self.inner.register_attachment(Arc::clone(&attachment));
                        return Ok(attachment);
                    }
                    Err(ConnectError::RateLimited) => return Err(OpenBucketError::RateLimited),
                    Err(ConnectError::Cancelled) => return Err(OpenBucketError::Cancelled),
                    Err(err) => {
                        warn!(bucket = name, seed = %endpoint, %kind, error = %err, "Bucket attach failed; trying next combination");
                    }
                }
            }
        }
        Err(OpenBucketError::BucketNotFound(name.to_owned()))
    }

    /// Re-bootstraps an existing bucket after it lost its nodes.
    ///
    /// Every node the bucket owns is evicted and disposed first; the seed
    /// endpoints are then walked until one attach succeeds. A failed attempt
    /// unregisters the attachment; a later success re-registers it.
    pub async fn rebootstrap(&self, name: &str) -> Result<(), OpenBucketError> {
        self.inner.ensure_live()?;
        let Some(attachment) = self
            .inner
            .buckets
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Err(OpenBucketError::BucketNotFound(name.to_owned()));
        };

        let _permit = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(OpenBucketError::Cancelled),
            permit = self.inner.attach_lock.lock() => permit,
        };

        attachment.clear_view();
        for node in self.inner.registry.clear_for(name) {
            node.dispose();
        }

        let seeds = self.inner.seeds.read().unwrap().clone();
        for endpoint in &seeds {
            let node = match self
                .inner
                .node_for_attach(endpoint, BucketKind::Couchbase)
                .await
            {
                Ok(node) => node,
                Err(ConnectError::RateLimited) => return Err(OpenBucketError::RateLimited),
                Err(ConnectError::Cancelled) => return Err(OpenBucketError::Cancelled),
                Err(err) => {
                    warn!(bucket = name, seed = %endpoint, error = %err, "Rebootstrap seed connect failed");
                    continue;
                }
            };

            let ctx = self.inner.reconcile_ctx();
            match attachment.attach(&node, &ctx).await {
                Ok(()) => {
                    self.inner.note_connected(&node);
                    self.inner.register_attachment(Arc::clone(&attachment));
                    return Ok(());
                }
                Err(ConnectError::RateLimited) => return Err(OpenBucketError::RateLimited),
                Err(ConnectError::Cancelled) => return Err(OpenBucketError::Cancelled),
                Err(err) => {
                    warn!(bucket = name, seed = %endpoint, error = %err, "Rebootstrap attach failed; trying next seed");
                    self.inner.unregister_attachment(name);
                }
            }
        }
        Err(OpenBucketError::BucketNotFound(name.to_owned()))
    }

    /// Feeds an externally received cluster map into the pump.
    pub fn publish_config(&self, map: ClusterMap) -> Result<(), DisposedError> {
        self.inner.ensure_live()?;
        self.inner.pump.publish(map);
        Ok(())
    }

    /// Registers a bootstrapped attachment and subscribes it to config
    /// updates.
    pub fn register_bucket(&self, attachment: Arc<BucketAttachment>) -> Result<(), DisposedError> {
        self.inner.ensure_live()?;
        self.inner.register_attachment(attachment);
        Ok(())
    }

    /// Unsubscribes and forgets the attachment for `name`, leaving its nodes
    /// registered.
    pub fn unregister_bucket(&self, name: &str) -> Result<(), DisposedError> {
        self.inner.ensure_live()?;
        self.inner.unregister_attachment(name);
        Ok(())
    }

    /// Tears the bucket down: unsubscribes it and evicts and disposes every
    /// node it owns.
    pub fn remove_bucket(&self, name: &str) -> Result<(), DisposedError> {
        self.inner.ensure_live()?;
        let attachment = self.inner.unregister_attachment(name);
        for node in self.inner.registry.clear_for(name) {
            node.dispose();
        }
        if let Some(attachment) = attachment {
            for node in attachment.dispose() {
                node.dispose();
            }
        }
        Ok(())
    }

    /// Removes the node at `endpoint` from the registry and disposes it.
    /// Returns true iff the endpoint was present and its handle has been
    /// disposed.
    pub fn remove_node(&self, endpoint: &Endpoint) -> Result<bool, DisposedError> {
        self.inner.ensure_live()?;
        match self.inner.registry.remove(endpoint) {
            Some(node) => {
                node.dispose();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Picks a random node advertising `service`, optionally scoped to the
    /// nodes owned by `bucket`.
    pub fn get_random_node_for_service(
        &self,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> Result<Arc<NodeHandle>, SelectionError> {
        self.inner.ensure_live()?;
        selector::select_for_service(&self.inner.registry, service, bucket)
    }

    /// The current node set: the whole registry, or a bucket's view.
    pub fn get_nodes(&self, bucket: Option<&str>) -> Result<Vec<Arc<NodeHandle>>, DisposedError> {
        self.inner.ensure_live()?;
        Ok(match bucket {
            Some(name) => self
                .inner
                .buckets
                .get(name)
                .map(|entry| entry.value().nodes())
                .unwrap_or_default(),
            None => self.inner.registry.snapshot(),
        })
    }

    /// The attachment registered for `name`, if any.
    pub fn get_bucket(&self, name: &str) -> Option<Arc<BucketAttachment>> {
        self.inner
            .buckets
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The last observed global cluster map.
    pub fn global_config(&self) -> Option<Arc<ClusterMap>> {
        self.inner.global_config.load_full()
    }

    /// Whether the most recently connected node understands collections.
    pub fn supports_collections(&self) -> bool {
        self.inner.supports_collections.load(Ordering::Acquire)
    }

    /// Whether the most recently connected node honors expiry preservation.
    pub fn supports_preserve_ttl(&self) -> bool {
        self.inner.supports_preserve_ttl.load(Ordering::Acquire)
    }

    /// Whether this core has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Tears the core down: cancels all suspendable work, stops the pump,
    /// disposes owned trace listeners, every attachment, and every remaining
    /// node. Idempotent; afterwards every public operation fails with
    /// `Disposed`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Disposing cluster core");
        self.inner.cancel.cancel();
        self.inner.pump.stop();

        for listener in self.inner.trace_listeners.lock().unwrap().drain(..) {
            listener.dispose();
        }

        let names: Vec<String> = self
            .inner
            .buckets
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, attachment)) = self.inner.buckets.remove(&name) {
                for node in attachment.dispose() {
                    node.dispose();
                }
            }
        }

        for node in self.inner.registry.clear_all() {
            node.dispose();
        }
    }
}

impl Drop for ClusterCore {
    fn drop(&mut self) {
        self.dispose();
        debug!(
            remaining = Arc::strong_count(&self.inner) - 1,
            "Cluster core dropped"
        );
    }
}
