//! This module contains various errors which can be returned by
//! [`ClusterCore`](crate::cluster::core::ClusterCore) and its collaborators.

use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::service::ServiceType;

/// An error produced while establishing or talking to a single cluster node.
///
/// These are surfaced by the [`ClusterNodeFactory`](crate::network::ClusterNodeFactory)
/// and [`NodeConnection`](crate::network::NodeConnection) collaborators. The core
/// absorbs them per bootstrap candidate (log and try the next endpoint), with two
/// exceptions: [`ConnectError::RateLimited`] and [`ConnectError::Cancelled`] are
/// always propagated to the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The server rejected a config fetch because no bucket is selected on the
    /// connection. Servers that predate the global config carrier answer
    /// bucket-less config requests this way.
    #[error("Server rejected the request: bucket not connected")]
    BucketNotConnected,

    /// The server asked the client to back off.
    #[error("Server is rate limiting this connection")]
    RateLimited,

    /// Cancellation was observed while the operation was suspended.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The peer answered with something the client could not make sense of.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An I/O error occurred on the underlying connection.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ConnectError {
    fn from(err: io::Error) -> ConnectError {
        ConnectError::Io(Arc::new(err))
    }
}

/// An error describing why a connection string yields no usable endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStringError {
    /// The scheme is not one of `couchbase` / `couchbases`.
    #[error("Unsupported connection string scheme: {0:?}")]
    UnsupportedScheme(String),

    /// A host entry carried a port that does not parse as a port number.
    #[error("Invalid port in host entry {0:?}")]
    InvalidPort(String),

    /// No host entries remained after parsing.
    #[error("No endpoints could be derived from the connection string")]
    NoEndpoints,
}

/// Error returned by [`ClusterCore::bootstrap_global`](crate::cluster::core::ClusterCore::bootstrap_global)
/// and core construction.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BootstrapError {
    /// The connection string could not be turned into a seed endpoint list.
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(#[from] ConnectionStringError),

    /// Every seed endpoint failed to produce a connected node. The next
    /// user-initiated bucket open retries bootstrap from scratch.
    #[error("All {attempts} bootstrap endpoints failed; last error: {last}")]
    NoNodesReachable {
        /// How many endpoints were attempted.
        attempts: usize,
        /// The error the last attempted endpoint failed with.
        last: ConnectError,
    },

    /// The server rate limited the bootstrap handshake. Surfaced verbatim;
    /// no further seed endpoints are attempted.
    #[error("Server is rate limiting bootstrap")]
    RateLimited,

    /// Bootstrap was cancelled.
    #[error("Bootstrap was cancelled")]
    Cancelled,

    /// The core has been disposed.
    #[error("The cluster core has been disposed")]
    Disposed,
}

/// Error returned by bucket attach and rebootstrap operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum OpenBucketError {
    /// Every (endpoint, bucket kind) combination was exhausted without a
    /// successful bootstrap.
    #[error("Bucket {0:?} was not found on any bootstrap endpoint")]
    BucketNotFound(String),

    /// The server rate limited the attach handshake. Surfaced verbatim;
    /// no further endpoint/kind combinations are attempted.
    #[error("Server is rate limiting bucket attachment")]
    RateLimited,

    /// The attach sequence was cancelled.
    #[error("Bucket attachment was cancelled")]
    Cancelled,

    /// The core has been disposed.
    #[error("The cluster core has been disposed")]
    Disposed,
}

/// Error returned by service-scoped node selection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SelectionError {
    /// No registered node advertises the capability for this service.
    #[error("Service {0} is not available on any cluster node")]
    ServiceNotAvailable(ServiceType),

    /// The service was requested for a bucket and none of the nodes owned by
    /// that bucket advertise it.
    #[error("Service {service} is missing on the nodes of bucket {bucket:?}")]
    ServiceMissing {
        /// The requested service.
        service: ServiceType,
        /// The bucket the selection was scoped to.
        bucket: String,
    },

    /// The core has been disposed.
    #[error("The cluster core has been disposed")]
    Disposed,
}

/// The cluster core has been disposed; no further operations are possible.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The cluster core has been disposed")]
pub struct DisposedError;

impl From<DisposedError> for BootstrapError {
    fn from(_: DisposedError) -> BootstrapError {
        BootstrapError::Disposed
    }
}

impl From<DisposedError> for OpenBucketError {
    fn from(_: DisposedError) -> OpenBucketError {
        OpenBucketError::Disposed
    }
}

impl From<DisposedError> for SelectionError {
    fn from(_: DisposedError) -> SelectionError {
        SelectionError::Disposed
    }
}
