//! Thread-safe collection of live node handles, keyed by endpoint.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::IndexedRandom;

use crate::cluster::node::{BucketKind, Endpoint, NodeHandle};

/// Mapping from [`Endpoint`] to [`NodeHandle`], with lookups over service
/// capability and owner.
///
/// A given endpoint appears at most once. Readers never block; writers only
/// contend on the same key. Iteration hands out a snapshot: a concurrent add
/// or remove does not mutate a view already taken.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<Endpoint, Arc<NodeHandle>>,
}

impl NodeRegistry {
    pub(crate) fn new() -> Self {
        NodeRegistry {
            nodes: DashMap::new(),
        }
    }

    /// Registers a handle. Returns false (and drops nothing) when a handle
    /// for the same endpoint is already present.
    pub fn add(&self, node: Arc<NodeHandle>) -> bool {
        match self.nodes.entry(node.endpoint.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(node);
                true
            }
        }
    }

    /// Removes and returns the handle at `endpoint`, if present. The caller
    /// is responsible for disposing it; disposal happens-after removal.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<NodeHandle>> {
        self.nodes.remove(endpoint).map(|(_, node)| node)
    }

    /// Looks up the handle at `endpoint`.
    pub fn try_get(&self, endpoint: &Endpoint) -> Option<Arc<NodeHandle>> {
        self.nodes.get(endpoint).map(|entry| Arc::clone(entry.value()))
    }

    /// Drains the registry, returning every handle that was registered.
    pub fn clear_all(&self) -> Vec<Arc<NodeHandle>> {
        let drained: Vec<_> = self
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        drained
            .into_iter()
            .filter_map(|endpoint| self.remove(&endpoint))
            .collect()
    }

    /// Removes and returns every handle owned by `bucket`.
    pub fn clear_for(&self, bucket: &str) -> Vec<Arc<NodeHandle>> {
        let owned: Vec<_> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().owner() == Some(bucket))
            .map(|entry| entry.key().clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|endpoint| self.remove(&endpoint))
            .collect()
    }

    /// A stable view of the registry contents at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// First handle satisfying `predicate`, in snapshot order.
    pub fn find_first(
        &self,
        predicate: impl Fn(&NodeHandle) -> bool,
    ) -> Option<Arc<NodeHandle>> {
        self.nodes
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Uniformly random handle among those satisfying `predicate` at snapshot
    /// time. Disposed handles never match.
    pub fn random(&self, predicate: impl Fn(&NodeHandle) -> bool) -> Option<Arc<NodeHandle>> {
        let candidates: Vec<_> = self
            .nodes
            .iter()
            .filter(|entry| !entry.value().is_disposed() && predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        candidates.choose(&mut rand::rng()).cloned()
    }

    /// An unassigned, undisposed handle connected to `endpoint` for `kind`,
    /// if one exists. Bucket attach reuses such handles instead of dialing a
    /// fresh connection.
    pub fn first_unassigned(
        &self,
        endpoint: &Endpoint,
        kind: BucketKind,
    ) -> Option<Arc<NodeHandle>> {
        self.try_get(endpoint).filter(|node| {
            node.kind == kind && node.is_unassigned() && !node.is_disposed()
        })
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
