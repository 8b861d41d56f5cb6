//! Lease handed to callers.

use std::fmt;
use std::ops::Deref;

use tidepool_core::ConnectionId;
use tokio::sync::mpsc;

use crate::core::PooledConnection;
use crate::driver::DriverMessage;

/// A temporary right to use one stream slot of a specific connection.
///
/// Exactly one caller holds a given lease. Dropping it (or calling
/// [`release`](Lease::release)) returns the stream slot to the pool, which
/// immediately hands it to the earliest queued request if one is waiting.
/// Release never suspends and never fails.
pub struct Lease<C>
where
    C: PooledConnection,
{
    connection: C,
    connection_id: ConnectionId,
    releases: mpsc::UnboundedSender<DriverMessage<C>>,
}

impl<C> Lease<C>
where
    C: PooledConnection,
{
    pub(crate) fn new(
        connection: C,
        connection_id: ConnectionId,
        releases: mpsc::UnboundedSender<DriverMessage<C>>,
    ) -> Self {
        Self {
            connection,
            connection_id,
            releases,
        }
    }

    /// The leased connection.
    #[must_use]
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Id of the leased connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Return the stream slot to the pool.
    ///
    /// Equivalent to dropping the lease; provided for callers who want the
    /// release to be visible in the code.
    pub fn release(self) {
        drop(self);
    }
}

impl<C> Deref for Lease<C>
where
    C: PooledConnection,
{
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C> fmt::Debug for Lease<C>
where
    C: PooledConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl<C> Drop for Lease<C>
where
    C: PooledConnection,
{
    fn drop(&mut self) {
        // The pool may already be gone (loop stopped after an external
        // closure); a failed send means there is nothing left to return
        // the slot to.
        let _ = self.releases.send(DriverMessage::Release {
            connection: self.connection_id,
        });
    }
}
