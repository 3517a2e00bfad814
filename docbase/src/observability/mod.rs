//! The request-tracing seam.
//!
//! The tracing subsystem itself is an external collaborator; the core's only
//! responsibilities are starting the configured listeners and disposing them
//! on teardown. Ambient diagnostics go through [`tracing`] directly.

use std::sync::Arc;

use tracing::debug;

/// A sink for trace output (threshold logging, orphan reporting). Owned by
/// the core once started; disposed exactly once with it.
pub trait TraceListener: Send + Sync {
    /// Releases whatever the listener holds. Must be idempotent.
    fn dispose(&self);
}

/// An external tracing subsystem the core can hand listeners to.
pub trait RequestTracer: Send + Sync {
    /// Starts feeding `listener`. Must not fail; a tracer that cannot start
    /// a listener logs and drops it.
    fn start(&self, listener: Arc<dyn TraceListener>);
}

/// The fallback listener used when tracing is enabled without a custom sink:
/// it only logs its own lifecycle.
pub struct LoggingTraceListener {
    scope: &'static str,
}

impl LoggingTraceListener {
    pub(crate) fn new(scope: &'static str) -> Self {
        LoggingTraceListener { scope }
    }
}

impl TraceListener for LoggingTraceListener {
    fn dispose(&self) {
        debug!(scope = self.scope, "Trace listener disposed");
    }
}
