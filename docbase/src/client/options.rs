//! ClusterOptions provides an easy way to configure a new cluster core.

use std::sync::Arc;

use crate::observability::TraceListener;

/// Options for one tracing sink (threshold logging or orphan reporting).
#[derive(Clone, Default)]
pub struct TracingSinkOptions {
    /// Whether the sink should be started with the core.
    pub enabled: bool,
    /// Custom listener; a logging fallback is used when enabled without one.
    pub listener: Option<Arc<dyn TraceListener>>,
}

impl std::fmt::Debug for TracingSinkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingSinkOptions")
            .field("enabled", &self.enabled)
            .field("listener", &self.listener.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Configuration consumed by [`ClusterCore`](crate::cluster::core::ClusterCore).
///
/// Options the core does not recognize simply do not exist here; embedders
/// layering their own configuration on top drop what they do not forward.
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Where to find the cluster. Required.
    pub connection_string: String,
    /// Forces TLS even when the connection string scheme does not ask for it.
    pub enable_tls: bool,
    /// Enables in-band config polling in addition to pushed updates.
    pub enable_config_polling: bool,
    /// Over-threshold request logging.
    pub threshold_tracing: TracingSinkOptions,
    /// Orphaned response reporting.
    pub orphan_tracing: TracingSinkOptions,
}

impl ClusterOptions {
    /// Starts building options.
    ///
    /// # Example
    ///
    /// ```
    /// use docbase::client::options::ClusterOptions;
    ///
    /// let options = ClusterOptions::builder()
    ///     .connection_string("couchbase://10.0.0.1,10.0.0.2")
    ///     .enable_config_polling(true)
    ///     .build();
    /// assert!(!options.enable_tls);
    /// ```
    pub fn builder() -> ClusterOptionsBuilder {
        ClusterOptionsBuilder {
            options: ClusterOptions::default(),
        }
    }
}

/// Used to conveniently configure [`ClusterOptions`].
#[derive(Debug, Clone)]
pub struct ClusterOptionsBuilder {
    options: ClusterOptions,
}

impl ClusterOptionsBuilder {
    /// Sets the connection string.
    ///
    /// # Example
    ///
    /// ```
    /// use docbase::client::options::ClusterOptions;
    ///
    /// let options = ClusterOptions::builder()
    ///     .connection_string("couchbases://cluster.example.com")
    ///     .build();
    /// assert_eq!(options.connection_string, "couchbases://cluster.example.com");
    /// ```
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.options.connection_string = connection_string.into();
        self
    }

    /// Forces TLS regardless of the connection string scheme.
    pub fn enable_tls(mut self, enable: bool) -> Self {
        self.options.enable_tls = enable;
        self
    }

    /// Enables in-band config polling.
    pub fn enable_config_polling(mut self, enable: bool) -> Self {
        self.options.enable_config_polling = enable;
        self
    }

    /// Enables over-threshold request logging, optionally with a custom
    /// listener.
    pub fn threshold_tracing(mut self, listener: Option<Arc<dyn TraceListener>>) -> Self {
        self.options.threshold_tracing = TracingSinkOptions {
            enabled: true,
            listener,
        };
        self
    }

    /// Enables orphaned response reporting, optionally with a custom
    /// listener.
    pub fn orphan_tracing(mut self, listener: Option<Arc<dyn TraceListener>>) -> Self {
        self.options.orphan_tracing = TracingSinkOptions {
            enabled: true,
            listener,
        };
        self
    }

    /// Finalizes the options.
    pub fn build(self) -> ClusterOptions {
        self.options
    }
}
