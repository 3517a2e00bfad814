//! Cluster maps: versioned snapshots of the cluster topology.

use std::collections::HashSet;

use crate::cluster::node::Endpoint;

/// Default key/value ports, used when an adapter omits them.
pub(crate) const DEFAULT_KV_PORT: u16 = 11210;
pub(crate) const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// How nodes of a bucket are located for key/value dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLocator {
    /// Vbucket-based location (Couchbase buckets).
    VBucket,
    /// Consistent-hashing location (Memcached buckets).
    Ketama,
}

/// Which address family of an adapter the client should connect to.
///
/// Clusters behind NAT publish an alternate address block per node; a client
/// outside the cluster network resolves endpoints against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkResolution {
    /// Use the canonical (internal) addresses.
    #[default]
    Default,
    /// Use the alternate (external) addresses where present.
    External,
}

/// Ports a node exposes per service, plain and TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServicePorts {
    /// Key/value port.
    pub kv: Option<u16>,
    /// Key/value port over TLS.
    pub kv_tls: Option<u16>,
    /// Management (HTTP) port.
    pub mgmt: Option<u16>,
    /// Query service port.
    pub query: Option<u16>,
    /// Search service port.
    pub search: Option<u16>,
    /// Analytics service port.
    pub analytics: Option<u16>,
    /// Views port.
    pub views: Option<u16>,
    /// Eventing port.
    pub eventing: Option<u16>,
}

/// Alternate address block of a node, published for clients outside the
/// cluster's own network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateAddress {
    /// Externally reachable hostname.
    pub hostname: String,
    /// Ports on the external hostname. Services without an entry fall back
    /// to the canonical port.
    pub ports: ServicePorts,
}

/// The per-node slice of a cluster map, used to construct and refresh a live
/// node handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAdapter {
    /// Canonical hostname of the node.
    pub hostname: String,
    /// Ports the node exposes on the canonical hostname.
    pub ports: ServicePorts,
    /// Alternate address block, if the cluster publishes one.
    pub alternate: Option<AlternateAddress>,
}

impl NodeAdapter {
    /// The host this adapter resolves to under `network`.
    pub fn resolved_host(&self, network: NetworkResolution) -> &str {
        match (network, &self.alternate) {
            (NetworkResolution::External, Some(alt)) => &alt.hostname,
            _ => &self.hostname,
        }
    }

    /// Computes the key/value endpoint for this adapter under the given
    /// network resolution and TLS mode.
    pub fn endpoint(&self, network: NetworkResolution, tls: bool) -> Endpoint {
        let ports = match (network, &self.alternate) {
            (NetworkResolution::External, Some(alt)) => {
                // Alternate blocks may omit ports; fall back to canonical.
                ServicePorts {
                    kv: alt.ports.kv.or(self.ports.kv),
                    kv_tls: alt.ports.kv_tls.or(self.ports.kv_tls),
                    ..alt.ports
                }
            }
            _ => self.ports,
        };
        let port = if tls {
            ports.kv_tls.unwrap_or(DEFAULT_KV_TLS_PORT)
        } else {
            ports.kv.unwrap_or(DEFAULT_KV_PORT)
        };
        Endpoint::new(self.resolved_host(network), port, tls)
    }
}

/// A versioned snapshot of cluster topology, as published by the server.
///
/// Revisions are monotonically non-decreasing per source. Maps produced by a
/// global (bucket-less) bootstrap carry `is_global = true`; maps pulled for a
/// bucket carry the bucket's name.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMap {
    /// Name of the bucket this map describes, absent for global maps.
    pub bucket: Option<String>,
    /// Revision counter of this snapshot.
    pub rev: u64,
    /// One adapter per node, in server-provided order.
    pub nodes: Vec<NodeAdapter>,
    /// Locator the bucket dispatches key/value traffic with.
    pub locator: NodeLocator,
    /// Which address family endpoints resolve against.
    pub network: NetworkResolution,
    /// True only when this map was produced by a global bootstrap.
    pub is_global: bool,
}

impl ClusterMap {
    /// The set of hosts this map names, under its own network resolution.
    /// Pruning compares membership on host only.
    pub(crate) fn host_set(&self) -> HashSet<&str> {
        self.nodes
            .iter()
            .map(|adapter| adapter.resolved_host(self.network))
            .collect()
    }
}
