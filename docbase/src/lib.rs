//! Cluster coordination core for the Docbase distributed document database.
//!
//! This crate is the client-side runtime that, given a connection string,
//! discovers a server cluster, keeps live node handles for every service the
//! client needs, routes service-scoped lookups to the right node, and reacts
//! to topology changes the cluster publishes.
//!
//! The entry point is [`ClusterCore`](cluster::core::ClusterCore), built from
//! [`ClusterOptions`](client::options::ClusterOptions) and a
//! [`Services`](cluster::core::Services) bundle of collaborators. The core
//! owns the [`NodeRegistry`](cluster::registry::NodeRegistry) and the set of
//! [`BucketAttachment`](cluster::bucket::BucketAttachment)s; wire protocol,
//! DNS and request execution live behind the seams in [`network`].
//!
//! Several cores can coexist in one process; each is an independent value
//! whose lifetime the caller owns.

pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod observability;
pub mod service;

pub use client::options::ClusterOptions;
pub use cluster::bucket::BucketAttachment;
pub use cluster::core::{ClusterCore, Services};
pub use cluster::node::{BucketKind, Endpoint, NodeCapabilities, NodeHandle, NodeRef};
pub use service::ServiceType;
