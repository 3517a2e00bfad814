//! Client-facing configuration: options and connection string handling.

pub mod connection_string;
pub mod options;

pub use connection_string::ConnectionString;
pub use options::{ClusterOptions, ClusterOptionsBuilder, TracingSinkOptions};
