//! Core collaborator contracts consumed by the pool.
//!
//! The pool is agnostic to what a connection transports. It interacts with
//! the outside world through three traits: [`PooledConnection`] (the minimal
//! capability a connection type must satisfy), [`ConnectionFactory`] (how new
//! connections are obtained) and [`KeepAlive`] (how idle connections are
//! validated).

use std::time::Duration;

use async_trait::async_trait;
use tidepool_core::{ConnectionCause, ConnectionId};

/// Boxed error produced by factories, transports and keep-alive probes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Minimal capability contract for a poolable connection.
///
/// Connections are expected to be cheap-to-clone handles, as is natural for
/// clients that multiplex several logical streams over one transport. The
/// pool is the sole owner of a connection's lifecycle state; implementations
/// only need to expose identity, close initiation and close observation.
#[async_trait]
pub trait PooledConnection: Clone + Send + Sync + 'static {
    /// The id this connection was created with. Stable for the connection's
    /// lifetime.
    fn id(&self) -> ConnectionId;

    /// Initiate an asynchronous close of the underlying transport.
    ///
    /// Must be idempotent and best-effort; completion is observed via
    /// [`closed`](PooledConnection::closed).
    fn close(&self);

    /// Resolves exactly once, when the underlying transport has fully
    /// closed, with the error that caused the closure if there was one.
    ///
    /// The pool awaits this for every established connection, which is also
    /// how externally-initiated closure (the server hanging up) is detected.
    async fn closed(&self) -> Option<ConnectionCause>;
}

/// A freshly established connection together with its stream capacity.
#[derive(Debug)]
pub struct Established<C> {
    /// The connection handle.
    pub connection: C,
    /// How many logical requests the connection can multiplex concurrently.
    /// Values below one are treated as one.
    pub stream_capacity: u16,
}

/// Produces new connections for the pool.
///
/// Invoked only by the pool driver, never concurrently for the same id.
/// Failures are recovered by the pool (backoff and retry); they are never
/// propagated out of the pool's event loop.
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync + 'static
where
    C: PooledConnection,
{
    /// Open a new connection under the given id.
    async fn connect(&self, id: ConnectionId) -> Result<Established<C>, BoxError>;
}

/// Periodic liveness probing for idle connections.
#[async_trait]
pub trait KeepAlive<C>: Send + Sync + 'static
where
    C: PooledConnection,
{
    /// How often idle connections are probed. `None` disables keep-alive
    /// entirely: no keep-alive timer is ever armed.
    fn frequency(&self) -> Option<Duration>;

    /// Run one liveness probe. A failure causes the connection to be closed
    /// and replaced.
    async fn probe(&self, connection: &C) -> Result<(), BoxError>;
}

/// Keep-alive behavior that never probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeepAlive;

#[async_trait]
impl<C> KeepAlive<C> for NoKeepAlive
where
    C: PooledConnection,
{
    fn frequency(&self) -> Option<Duration> {
        None
    }

    async fn probe(&self, _connection: &C) -> Result<(), BoxError> {
        Ok(())
    }
}
