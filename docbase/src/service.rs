//! Service types a cluster node can offer.

use std::fmt::Display;

/// A service offered by one or more nodes of the cluster.
///
/// Nodes advertise the services they run during the connection handshake; the
/// core uses this advertisement to route service-scoped requests. Key/value
/// traffic is dispatched by the bucket's locator rather than by random
/// selection, but key/value capability still participates in selection (the
/// config poller picks its source node this way).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServiceType {
    /// The key/value (memcached protocol) service.
    KeyValue,
    /// The query service.
    Query,
    /// The full-text search service.
    Search,
    /// The analytics service.
    Analytics,
    /// The views service. Views are always scoped to a bucket.
    Views,
    /// The eventing service.
    Eventing,
}

impl ServiceType {
    /// The wire name of the service, as it appears in cluster maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::Analytics => "cbas",
            ServiceType::Views => "views",
            ServiceType::Eventing => "eventing",
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
