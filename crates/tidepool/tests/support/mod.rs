//! Shared test doubles: a scriptable connection factory, keep-alive
//! behavior, and a counting observer.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tidepool::{
    BoxError, ConnectionCause, ConnectionFactory, ConnectionId, Established, KeepAlive,
    PoolObserver, PooledConnection,
};
use tokio_util::sync::CancellationToken;

/// In-memory connection handle with a severable "transport".
#[derive(Clone)]
pub struct TestConnection {
    id: ConnectionId,
    transport: CancellationToken,
}

impl TestConnection {
    fn open(id: ConnectionId) -> Self {
        Self {
            id,
            transport: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_cancelled()
    }

    /// Simulate the remote end dropping the transport.
    pub fn sever(&self) {
        self.transport.cancel();
    }
}

#[async_trait]
impl PooledConnection for TestConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        self.transport.cancel();
    }

    async fn closed(&self) -> Option<ConnectionCause> {
        self.transport.cancelled().await;
        None
    }
}

/// Factory with a script of failures; unscripted calls succeed.
pub struct TestFactory {
    capacity: u16,
    outcomes: Mutex<VecDeque<Result<(), String>>>,
    connections: Mutex<Vec<TestConnection>>,
    calls: AtomicUsize,
}

impl TestFactory {
    pub fn new(capacity: u16) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            outcomes: Mutex::new(VecDeque::new()),
            connections: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Queue a failure for the next factory call.
    pub fn push_failure(&self, message: &str) {
        self.outcomes.lock().push_back(Err(message.to_owned()));
    }

    pub fn connect_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `index`-th successfully created connection.
    pub fn connection(&self, index: usize) -> TestConnection {
        self.connections.lock()[index].clone()
    }

    pub fn created_connections(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory<TestConnection> for TestFactory {
    async fn connect(&self, id: ConnectionId) -> Result<Established<TestConnection>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                let connection = TestConnection::open(id);
                self.connections.lock().push(connection.clone());
                Ok(Established {
                    connection,
                    stream_capacity: self.capacity,
                })
            }
            Err(message) => Err(message.into()),
        }
    }
}

/// Keep-alive with a fixed frequency and a script of probe failures.
pub struct TestKeepAlive {
    frequency: Duration,
    outcomes: Mutex<VecDeque<Result<(), String>>>,
    probes: AtomicUsize,
}

impl TestKeepAlive {
    pub fn new(frequency: Duration) -> Arc<Self> {
        Arc::new(Self {
            frequency,
            outcomes: Mutex::new(VecDeque::new()),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn push_failure(&self, message: &str) {
        self.outcomes.lock().push_back(Err(message.to_owned()));
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeepAlive<TestConnection> for TestKeepAlive {
    fn frequency(&self) -> Option<Duration> {
        Some(self.frequency)
    }

    async fn probe(&self, _connection: &TestConnection) -> Result<(), BoxError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
        outcome.map_err(Into::into)
    }
}

/// Observer counting lifecycle callbacks.
#[derive(Debug, Default)]
pub struct CountingObserver {
    pub connects_started: AtomicUsize,
    pub connects_succeeded: AtomicUsize,
    pub connects_failed: AtomicUsize,
    pub leases: AtomicUsize,
    pub releases: AtomicUsize,
    pub probes: AtomicUsize,
    pub closes: AtomicUsize,
}

impl PoolObserver for CountingObserver {
    fn connect_started(&self, _id: ConnectionId) {
        self.connects_started.fetch_add(1, Ordering::SeqCst);
    }

    fn connect_succeeded(&self, _id: ConnectionId, _streams: u16) {
        self.connects_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn connect_failed(&self, _id: ConnectionId) {
        self.connects_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_leased(&self, _id: ConnectionId) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_released(&self, _id: ConnectionId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn keep_alive_triggered(&self, _id: ConnectionId) {
        self.probes.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self, _id: ConnectionId) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds, bailing out after a wall-clock timeout.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}
