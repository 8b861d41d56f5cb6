//! Observability sink for pool lifecycle events.
//!
//! Observers are purely informational: callbacks are synchronous,
//! fire-and-forget, must not block, and have no effect on pool control flow.

use tracing::{debug, trace};

use crate::types::ConnectionId;

/// Receiver of pool lifecycle events.
///
/// Every method has a no-op default body, so implementations only override
/// the events they care about.
#[allow(unused_variables)]
pub trait PoolObserver: Send + Sync + 'static {
    /// A connection attempt was started.
    fn connect_started(&self, id: ConnectionId) {}

    /// A connection attempt succeeded; `streams` is its multiplexing
    /// capacity.
    fn connect_succeeded(&self, id: ConnectionId, streams: u16) {}

    /// A connection attempt failed.
    fn connect_failed(&self, id: ConnectionId) {}

    /// A stream slot on the connection was leased to a caller.
    fn stream_leased(&self, id: ConnectionId) {}

    /// A stream slot on the connection was returned.
    fn stream_released(&self, id: ConnectionId) {}

    /// A keep-alive probe was started.
    fn keep_alive_triggered(&self, id: ConnectionId) {}

    /// A keep-alive probe succeeded.
    fn keep_alive_succeeded(&self, id: ConnectionId) {}

    /// A keep-alive probe failed; the connection will be replaced.
    fn keep_alive_failed(&self, id: ConnectionId) {}

    /// A close was requested for the connection.
    fn connection_closing(&self, id: ConnectionId) {}

    /// The connection's transport has fully closed.
    fn connection_closed(&self, id: ConnectionId) {}

    /// The number of queued lease requests changed.
    fn queue_depth_changed(&self, depth: usize) {}

    /// Leased stream count or total capacity changed.
    fn utilization_changed(&self, leased_streams: usize, total_streams: usize) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}

/// Observer that maps lifecycle events onto `tracing`.
///
/// High-frequency events (lease/release, utilization) log at `trace`,
/// everything else at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn connect_started(&self, id: ConnectionId) {
        debug!(%id, "connection attempt started");
    }

    fn connect_succeeded(&self, id: ConnectionId, streams: u16) {
        debug!(%id, streams, "connection established");
    }

    fn connect_failed(&self, id: ConnectionId) {
        debug!(%id, "connection attempt failed");
    }

    fn stream_leased(&self, id: ConnectionId) {
        trace!(%id, "stream leased");
    }

    fn stream_released(&self, id: ConnectionId) {
        trace!(%id, "stream released");
    }

    fn keep_alive_triggered(&self, id: ConnectionId) {
        trace!(%id, "keep-alive probe started");
    }

    fn keep_alive_succeeded(&self, id: ConnectionId) {
        trace!(%id, "keep-alive probe succeeded");
    }

    fn keep_alive_failed(&self, id: ConnectionId) {
        debug!(%id, "keep-alive probe failed");
    }

    fn connection_closing(&self, id: ConnectionId) {
        debug!(%id, "closing connection");
    }

    fn connection_closed(&self, id: ConnectionId) {
        debug!(%id, "connection closed");
    }

    fn queue_depth_changed(&self, depth: usize) {
        trace!(depth, "lease queue depth changed");
    }

    fn utilization_changed(&self, leased_streams: usize, total_streams: usize) {
        trace!(leased_streams, total_streams, "pool utilization changed");
    }
}
