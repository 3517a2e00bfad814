use uuid::Uuid;

use crate::cluster::config::NodeAdapter;
use crate::errors::ConnectError;
use crate::network::NodeConnection;
use crate::service::ServiceType;

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock, RwLock},
};

/// Network identity of a cluster node: host, port and whether the connection
/// to it is TLS-protected.
///
/// Endpoints compare by exact equality (host, port and TLS flag all match).
/// Topology pruning intentionally compares on host only, see
/// [`Endpoint::same_host`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Endpoint {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Host of the node, as a hostname or a literal IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the node.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this endpoint use TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Host-only equality, used when pruning nodes against a new cluster map.
    ///
    /// Alternate-address ports may be reported differently across map
    /// revisions, so pruning on (host, port) would churn connections.
    pub fn same_host(&self, other: &Endpoint) -> bool {
        self.host == other.host
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The kind of bucket a node is connected for.
///
/// Couchbase buckets use the vbucket locator and require a `SELECT_BUCKET`
/// handshake on key/value connections; Memcached buckets use ketama and skip
/// the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    /// A vbucket-located bucket.
    Couchbase,
    /// A ketama-located, cache-only bucket.
    Memcached,
}

impl BucketKind {
    /// The order in which bucket kinds are attempted during a bucket attach.
    /// The attempt order is part of the attach contract.
    pub const ATTACH_ORDER: [BucketKind; 2] = [BucketKind::Couchbase, BucketKind::Memcached];
}

impl Display for BucketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketKind::Couchbase => write!(f, "couchbase"),
            BucketKind::Memcached => write!(f, "memcached"),
        }
    }
}

/// The fixed set of capabilities a node advertises during the handshake.
///
/// Immutable between handshakes; refreshed once after `SELECT_BUCKET`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    /// Node serves key/value traffic.
    pub kv: bool,
    /// Node serves query requests.
    pub query: bool,
    /// Node serves full-text search requests.
    pub search: bool,
    /// Node serves analytics requests.
    pub analytics: bool,
    /// Node serves view requests.
    pub views: bool,
    /// Node serves eventing requests.
    pub eventing: bool,
    /// Node understands collection-qualified operations.
    pub collections: bool,
    /// Node honors expiry preservation on mutation.
    pub preserve_ttl: bool,
}

impl NodeCapabilities {
    /// Whether the node advertises the capability backing `service`.
    pub fn supports(&self, service: ServiceType) -> bool {
        match service {
            ServiceType::KeyValue => self.kv,
            ServiceType::Query => self.query,
            ServiceType::Search => self.search,
            ServiceType::Analytics => self.analytics,
            ServiceType::Views => self.views,
            ServiceType::Eventing => self.eventing,
        }
    }
}

/// NodeHandle represents a connected cluster node along with its data.
///
/// A handle is born in a [`ClusterNodeFactory`](crate::network::ClusterNodeFactory)
/// and registered with the [`NodeRegistry`](crate::cluster::registry::NodeRegistry).
/// An unassigned handle has no owner; a bucket may claim it exactly once and
/// the handle stays owned until it is removed and disposed. If a node changes
/// its address it is not represented by the same handle; reconciliation
/// creates a fresh one.
pub struct NodeHandle {
    /// Unique identifier of this handle.
    pub id: Uuid,
    /// Endpoint this handle is connected to.
    pub endpoint: Endpoint,
    /// Bucket kind the connection was established for.
    pub kind: BucketKind,

    capabilities: RwLock<NodeCapabilities>,
    owner: OnceLock<String>,
    adapter: RwLock<Option<Arc<NodeAdapter>>>,
    connection: Arc<dyn NodeConnection>,
    disposed: AtomicBool,
}

/// A way that node handles are passed and accessed in the core's code.
pub type NodeRef<'a> = &'a Arc<NodeHandle>;

impl NodeHandle {
    /// Creates a handle around an established connection.
    ///
    /// This is intended for [`ClusterNodeFactory`](crate::network::ClusterNodeFactory)
    /// implementations; the core never constructs handles itself.
    pub fn new(
        endpoint: Endpoint,
        kind: BucketKind,
        connection: Arc<dyn NodeConnection>,
        adapter: Option<NodeAdapter>,
    ) -> Self {
        let capabilities = connection.capabilities();
        NodeHandle {
            id: Uuid::new_v4(),
            endpoint,
            kind,
            capabilities: RwLock::new(capabilities),
            owner: OnceLock::new(),
            adapter: RwLock::new(adapter.map(Arc::new)),
            connection,
            disposed: AtomicBool::new(false),
        }
    }

    /// Capabilities the node advertised at the last handshake.
    pub fn capabilities(&self) -> NodeCapabilities {
        *self.capabilities.read().unwrap()
    }

    /// Name of the bucket that owns this node, if any.
    pub fn owner(&self) -> Option<&str> {
        self.owner.get().map(String::as_str)
    }

    /// True if no bucket has claimed this node yet.
    pub fn is_unassigned(&self) -> bool {
        self.owner.get().is_none()
    }

    /// Claims this node for `bucket`. A node can be claimed at most once;
    /// returns false if it is already owned (by any bucket).
    pub(crate) fn try_claim(&self, bucket: &str) -> bool {
        self.owner.set(bucket.to_owned()).is_ok()
    }

    /// The cluster-map slice this handle was last reconciled against.
    pub fn adapter(&self) -> Option<Arc<NodeAdapter>> {
        self.adapter.read().unwrap().clone()
    }

    /// Replaces the adapter after a new cluster map named this node.
    pub(crate) fn set_adapter(&self, adapter: NodeAdapter) {
        *self.adapter.write().unwrap() = Some(Arc::new(adapter));
    }

    /// Performs the `SELECT_BUCKET` handshake and refreshes the advertised
    /// capabilities afterwards (the server may re-negotiate features once a
    /// bucket is selected).
    pub(crate) async fn select_bucket(&self, bucket: &str) -> Result<(), ConnectError> {
        self.connection.select_bucket(bucket).await?;
        self.refresh_capabilities();
        Ok(())
    }

    /// Re-reads the advertised capabilities from the connection.
    pub(crate) fn refresh_capabilities(&self) {
        *self.capabilities.write().unwrap() = self.connection.capabilities();
    }

    /// Fetches the bucket-less global cluster map over this connection.
    pub(crate) async fn fetch_global_map(
        &self,
    ) -> Result<crate::cluster::config::ClusterMap, ConnectError> {
        self.connection.fetch_global_map().await
    }

    /// Fetches the cluster map for `bucket` over this connection.
    pub(crate) async fn fetch_bucket_map(
        &self,
        bucket: &str,
    ) -> Result<crate::cluster::config::ClusterMap, ConnectError> {
        self.connection.fetch_bucket_map(bucket).await
    }

    /// Tears down the handle. Idempotent: only the first call shuts the
    /// connection down and returns true. Disposal happens-after removal from
    /// the registry.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.connection.shutdown();
        true
    }

    /// Whether this handle has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("owner", &self.owner.get())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
