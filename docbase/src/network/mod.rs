//! Narrow interfaces to the networking collaborators the core drives.
//!
//! The core never opens sockets itself: nodes are born in a
//! [`ClusterNodeFactory`], DNS-SRV resolution is a pure lookup behind
//! [`DnsResolver`], and everything the core needs from an established
//! connection is the handshake surface of [`NodeConnection`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::config::{ClusterMap, NodeAdapter};
use crate::cluster::node::{BucketKind, Endpoint, NodeCapabilities, NodeHandle};
use crate::errors::ConnectError;

/// The handshake surface of one established node connection.
///
/// Implementations own the wire protocol; the core only ever drives these
/// four operations and the synchronous shutdown.
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Capabilities the server advertised at the most recent handshake.
    fn capabilities(&self) -> NodeCapabilities;

    /// Binds this connection to `bucket`.
    async fn select_bucket(&self, bucket: &str) -> Result<(), ConnectError>;

    /// Fetches the bucket-less global cluster map. Servers without global
    /// config support fail this with [`ConnectError::BucketNotConnected`].
    async fn fetch_global_map(&self) -> Result<ClusterMap, ConnectError>;

    /// Fetches the cluster map for `bucket` in-band.
    async fn fetch_bucket_map(&self, bucket: &str) -> Result<ClusterMap, ConnectError>;

    /// Signals the connection to close. Must not block; pending operations
    /// observe the closure as an I/O error.
    fn shutdown(&self);
}

/// The only way node handles are born. Ownership of the returned handle
/// transfers to the caller.
#[async_trait]
pub trait ClusterNodeFactory: Send + Sync {
    /// Establishes a connection to `endpoint` for a bucket of `kind` and
    /// wraps it in a handle. `adapter` is attached when the node was named by
    /// a cluster map; seed nodes connect without one.
    async fn create_and_connect(
        &self,
        endpoint: &Endpoint,
        kind: BucketKind,
        adapter: Option<NodeAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Arc<NodeHandle>, ConnectError>;
}

/// DNS-SRV resolution, a pure function from hostname to endpoint list.
///
/// May return an empty list; errors are non-fatal to bootstrap and are only
/// logged by the core.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolves the SRV record set for `hostname`.
    async fn resolve_srv(
        &self,
        hostname: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Endpoint>, io::Error>;
}

/// Runs `fut` until completion or until `cancel` fires, whichever is first.
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        res = fut => res,
    }
}
