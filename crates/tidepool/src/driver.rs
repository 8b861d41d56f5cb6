//! Pool driver: executes the state machine's decisions against real
//! asynchronous I/O.
//!
//! The driver owns the single serialization domain for one pool. Every
//! external call becomes a message on an ordered channel; a single event
//! loop applies messages to the machine one at a time and performs the
//! resulting actions: invoking the connection factory, running keep-alive
//! probes, closing connections, and arming timers against the injected
//! clock. Side-effect failures (a factory error or panic, a failed probe)
//! are translated back into machine events and never escape the loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tidepool_core::{
    Clock, ConfigError, ConnectionCause, ConnectionId, ConnectionIdGenerator, NoopObserver,
    PoolConfig, PoolError, PoolObserver, PoolResult, RequestId, RequestIdGenerator, SystemClock,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{ConnectionFactory, KeepAlive, NoKeepAlive, PooledConnection};
use crate::lease::Lease;
use crate::machine::{Action, Actions, Event, MachineStats, PoolMachine, TimerKey, TimerKind};

/// Messages feeding the event loop, in submission order.
pub(crate) enum DriverMessage<C>
where
    C: PooledConnection,
{
    Lease {
        request: RequestId,
        responder: oneshot::Sender<PoolResult<Lease<C>>>,
    },
    Cancel {
        request: RequestId,
    },
    Release {
        connection: ConnectionId,
    },
    Established {
        id: ConnectionId,
        connection: C,
        capacity: u16,
    },
    ConnectFailed {
        id: ConnectionId,
        error: ConnectionCause,
    },
    Closed {
        id: ConnectionId,
        error: Option<ConnectionCause>,
    },
    KeepAliveDone {
        id: ConnectionId,
        result: Result<(), ConnectionCause>,
    },
    TimerElapsed {
        key: TimerKey,
        epoch: u64,
    },
}

#[derive(Debug, Error)]
#[error("{0} panicked")]
struct CollaboratorPanicked(&'static str);

/// Read-mostly snapshot of a pool's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections in any lifecycle state, in-flight attempts included.
    pub connections: usize,
    /// Established connections with zero leased streams.
    pub idle_connections: usize,
    /// Stream slots currently leased out.
    pub leased_streams: usize,
    /// Total stream slots across established connections.
    pub total_streams: usize,
    /// Lease requests waiting for capacity.
    pub queued_requests: usize,
}

#[derive(Debug, Default)]
struct StatsCells {
    connections: AtomicUsize,
    idle_connections: AtomicUsize,
    leased_streams: AtomicUsize,
    total_streams: AtomicUsize,
    queued_requests: AtomicUsize,
}

impl StatsCells {
    fn publish(&self, stats: MachineStats) {
        self.connections.store(stats.connections, Ordering::Relaxed);
        self.idle_connections
            .store(stats.idle_connections, Ordering::Relaxed);
        self.leased_streams
            .store(stats.leased_streams, Ordering::Relaxed);
        self.total_streams
            .store(stats.total_streams, Ordering::Relaxed);
        self.queued_requests
            .store(stats.queue_depth, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections: self.connections.load(Ordering::Relaxed),
            idle_connections: self.idle_connections.load(Ordering::Relaxed),
            leased_streams: self.leased_streams.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            queued_requests: self.queued_requests.load(Ordering::Relaxed),
        }
    }
}

/// A single connection pool.
///
/// The handle is cheap to clone and safe to share; all mutation happens in
/// the event loop started by [`run`](Pool::run). Construction wires in the
/// four collaborator contracts (factory, keep-alive, observer, clock)
/// explicitly, so there is no hidden global state and tests can substitute
/// a virtual clock.
pub struct Pool<C>
where
    C: PooledConnection,
{
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for Pool<C>
where
    C: PooledConnection,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for Pool<C>
where
    C: PooledConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct PoolInner<C>
where
    C: PooledConnection,
{
    tx: mpsc::UnboundedSender<DriverMessage<C>>,
    request_ids: RequestIdGenerator,
    stats: Arc<StatsCells>,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<EventLoop<C>>>,
}

impl<C> Pool<C>
where
    C: PooledConnection,
{
    /// Create a pool with default keep-alive (none), observer (none) and
    /// clock (system).
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Result<Self, ConfigError> {
        Self::with_components(
            config,
            factory,
            Arc::new(NoKeepAlive),
            Arc::new(NoopObserver),
            Arc::new(SystemClock),
        )
    }

    /// Create a pool with every collaborator injected explicitly.
    pub fn with_components(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
        keep_alive: Arc<dyn KeepAlive<C>>,
        observer: Arc<dyn PoolObserver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::build(
            config,
            factory,
            keep_alive,
            observer,
            clock,
            Arc::new(ConnectionIdGenerator::new()),
        )
    }

    pub(crate) fn build(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
        keep_alive: Arc<dyn KeepAlive<C>>,
        observer: Arc<dyn PoolObserver>,
        clock: Arc<dyn Clock>,
        ids: Arc<ConnectionIdGenerator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsCells::default());
        let shutdown = CancellationToken::new();
        let machine = PoolMachine::new(config, keep_alive.frequency(), ids);
        let event_loop = EventLoop {
            machine,
            rx,
            tx: tx.clone(),
            connections: HashMap::new(),
            responders: HashMap::new(),
            timers: HashMap::new(),
            factory,
            keep_alive,
            observer,
            clock,
            stats: Arc::clone(&stats),
            shutdown: shutdown.clone(),
            last_stats: MachineStats::default(),
        };
        Ok(Self {
            inner: Arc::new(PoolInner {
                tx,
                request_ids: RequestIdGenerator::new(),
                stats,
                shutdown,
                event_loop: Mutex::new(Some(event_loop)),
            }),
        })
    }

    /// Borrow one stream slot from the pool.
    ///
    /// Suspends until a lease is available, the pool shuts down, or the
    /// caller cancels by dropping the future. A cancellation that lands
    /// after assignment but before delivery returns the slot to the pool;
    /// no stream is leaked.
    pub async fn lease(&self) -> PoolResult<Lease<C>> {
        let request = self.inner.request_ids.next_id();
        let (responder, receiver) = oneshot::channel();
        if self
            .inner
            .tx
            .send(DriverMessage::Lease { request, responder })
            .is_err()
        {
            return Err(PoolError::Shutdown);
        }

        let mut cancel_guard = CancelOnDrop {
            inner: self.inner.as_ref(),
            request,
            armed: true,
        };
        let outcome = receiver.await;
        cancel_guard.armed = false;
        // A dropped responder means the loop stopped before deciding.
        outcome.unwrap_or(Err(PoolError::Shutdown))
    }

    /// Request a graceful shutdown. Idempotent.
    ///
    /// Queued lease requests fail immediately; idle connections close at
    /// once and leased connections once their streams drain. [`run`]
    /// (Pool::run) returns when everything has stopped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Drive the pool until shutdown completes.
    ///
    /// Must be called exactly once; a second call fails with
    /// [`PoolError::AlreadyRunning`].
    pub async fn run(&self) -> PoolResult<()> {
        let event_loop = self
            .inner
            .event_loop
            .lock()
            .take()
            .ok_or(PoolError::AlreadyRunning)?;
        event_loop.run().await;
        Ok(())
    }

    /// Current pool statistics. Eventually consistent: updated by the event
    /// loop after each processed event.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }
}

/// Sends a cancel message if the lease future is dropped mid-wait.
struct CancelOnDrop<'a, C>
where
    C: PooledConnection,
{
    inner: &'a PoolInner<C>,
    request: RequestId,
    armed: bool,
}

impl<C> Drop for CancelOnDrop<'_, C>
where
    C: PooledConnection,
{
    fn drop(&mut self) {
        if self.armed {
            let _ = self.inner.tx.send(DriverMessage::Cancel {
                request: self.request,
            });
        }
    }
}

/// The single-owner event loop behind one pool.
struct EventLoop<C>
where
    C: PooledConnection,
{
    machine: PoolMachine,
    rx: mpsc::UnboundedReceiver<DriverMessage<C>>,
    tx: mpsc::UnboundedSender<DriverMessage<C>>,
    connections: HashMap<ConnectionId, C>,
    responders: HashMap<RequestId, oneshot::Sender<PoolResult<Lease<C>>>>,
    timers: HashMap<TimerKey, (u64, AbortHandle)>,
    factory: Arc<dyn ConnectionFactory<C>>,
    keep_alive: Arc<dyn KeepAlive<C>>,
    observer: Arc<dyn PoolObserver>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsCells>,
    shutdown: CancellationToken,
    last_stats: MachineStats,
}

enum LoopInput<C>
where
    C: PooledConnection,
{
    Message(DriverMessage<C>),
    ShutdownRequested,
    SendersGone,
}

impl<C> EventLoop<C>
where
    C: PooledConnection,
{
    async fn run(mut self) {
        let startup = self.machine.bootstrap();
        self.perform(startup);
        self.publish_stats();

        let shutdown = self.shutdown.clone();
        let mut shutdown_requested = false;
        loop {
            let input = tokio::select! {
                _ = shutdown.cancelled(), if !shutdown_requested => LoopInput::ShutdownRequested,
                message = self.rx.recv() => match message {
                    Some(message) => LoopInput::Message(message),
                    None => LoopInput::SendersGone,
                },
            };

            let stopped = match input {
                LoopInput::Message(message) => self.handle(message),
                LoopInput::ShutdownRequested => {
                    shutdown_requested = true;
                    let actions = self.machine.apply(Event::Shutdown);
                    self.perform(actions)
                }
                // Every handle is gone and no task holds a sender: nothing
                // can ever reach this pool again.
                LoopInput::SendersGone => true,
            };
            self.publish_stats();
            if stopped {
                break;
            }
        }
        self.finish();
    }

    /// Apply one message to the machine and execute the resulting actions.
    /// Returns true once shutdown has fully drained.
    fn handle(&mut self, message: DriverMessage<C>) -> bool {
        let actions = match message {
            DriverMessage::Lease { request, responder } => {
                self.responders.insert(request, responder);
                self.machine.apply(Event::RequestLease(request))
            }
            DriverMessage::Cancel { request } => {
                self.machine.apply(Event::CancelRequest(request))
            }
            DriverMessage::Release { connection } => {
                self.observer.stream_released(connection);
                self.machine.apply(Event::StreamReleased { id: connection })
            }
            DriverMessage::Established {
                id,
                connection,
                capacity,
            } => {
                self.observer.connect_succeeded(id, capacity);
                self.spawn_close_watcher(id, connection.clone());
                self.connections.insert(id, connection);
                self.machine
                    .apply(Event::ConnectionEstablished { id, capacity })
            }
            DriverMessage::ConnectFailed { id, error } => {
                warn!(%id, %error, "connection attempt failed");
                self.observer.connect_failed(id);
                self.machine.apply(Event::ConnectionFailed { id, error })
            }
            DriverMessage::Closed { id, error } => {
                if let Some(error) = &error {
                    debug!(%id, %error, "connection closed with error");
                }
                self.connections.remove(&id);
                self.observer.connection_closed(id);
                self.machine.apply(Event::ConnectionClosed { id })
            }
            DriverMessage::KeepAliveDone { id, result } => match result {
                Ok(()) => {
                    self.observer.keep_alive_succeeded(id);
                    self.machine.apply(Event::KeepAliveSucceeded { id })
                }
                Err(error) => {
                    warn!(%id, %error, "keep-alive probe failed");
                    self.observer.keep_alive_failed(id);
                    self.machine.apply(Event::KeepAliveFailed { id, error })
                }
            },
            DriverMessage::TimerElapsed { key, epoch } => {
                if self
                    .timers
                    .get(&key)
                    .is_some_and(|(armed_epoch, _)| *armed_epoch == epoch)
                {
                    self.timers.remove(&key);
                }
                let event = match key.kind {
                    TimerKind::IdleTimeout => Event::IdleTimeoutFired {
                        id: key.connection,
                        epoch,
                    },
                    TimerKind::KeepAlive => Event::KeepAliveFired {
                        id: key.connection,
                        epoch,
                    },
                    TimerKind::ConnectBackoff => Event::BackoffFired {
                        id: key.connection,
                        epoch,
                    },
                };
                self.machine.apply(event)
            }
        };
        self.perform(actions)
    }

    fn perform(&mut self, actions: Actions) -> bool {
        let mut stopped = false;
        for action in actions {
            match action {
                Action::CreateConnection { id } => self.start_connect(id),
                Action::AssignRequest {
                    request,
                    connection,
                } => self.assign(request, connection),
                Action::FailRequest { request, error } => {
                    if let Some(responder) = self.responders.remove(&request) {
                        let _ = responder.send(Err(error));
                    }
                }
                Action::CloseConnection { id } => {
                    self.observer.connection_closing(id);
                    if let Some(connection) = self.connections.get(&id) {
                        connection.close();
                    }
                }
                Action::RunKeepAlive { id } => self.start_keep_alive(id),
                Action::ScheduleTimer { key, epoch, delay } => {
                    self.arm_timer(key, epoch, delay);
                }
                Action::CancelTimer { key } => {
                    if let Some((_, handle)) = self.timers.remove(&key) {
                        handle.abort();
                    }
                }
                Action::ShutdownComplete => stopped = true,
            }
        }
        stopped
    }

    fn start_connect(&self, id: ConnectionId) {
        self.observer.connect_started(id);
        let factory = Arc::clone(&self.factory);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(factory.connect(id)).catch_unwind().await;
            let message = match outcome {
                Ok(Ok(established)) => DriverMessage::Established {
                    id,
                    connection: established.connection,
                    capacity: established.stream_capacity,
                },
                Ok(Err(error)) => DriverMessage::ConnectFailed {
                    id,
                    error: Arc::from(error),
                },
                Err(_) => DriverMessage::ConnectFailed {
                    id,
                    error: Arc::new(CollaboratorPanicked("connection factory")),
                },
            };
            let _ = tx.send(message);
        });
    }

    fn assign(&mut self, request: RequestId, connection: ConnectionId) {
        let Some(responder) = self.responders.remove(&request) else {
            return;
        };
        let Some(handle) = self.connections.get(&connection).cloned() else {
            let _ = responder.send(Err(PoolError::Shutdown));
            return;
        };
        self.observer.stream_leased(connection);
        let lease = Lease::new(handle, connection, self.tx.clone());
        // A failed send means the caller cancelled between assignment and
        // delivery; the rejected lease is dropped by the send, which queues
        // the release and hands the slot to the next request in line.
        let _ = responder.send(Ok(lease));
    }

    fn start_keep_alive(&self, id: ConnectionId) {
        let Some(connection) = self.connections.get(&id).cloned() else {
            return;
        };
        self.observer.keep_alive_triggered(id);
        let keep_alive = Arc::clone(&self.keep_alive);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(keep_alive.probe(&connection))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(ConnectionCause::from(error)),
                Err(_) => {
                    let cause: ConnectionCause =
                        Arc::new(CollaboratorPanicked("keep-alive probe"));
                    Err(cause)
                }
            };
            let _ = tx.send(DriverMessage::KeepAliveDone { id, result });
        });
    }

    fn spawn_close_watcher(&self, id: ConnectionId, connection: C) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let error = connection.closed().await;
            let _ = tx.send(DriverMessage::Closed { id, error });
        });
    }

    fn arm_timer(&mut self, key: TimerKey, epoch: u64, delay: Duration) {
        if let Some((_, superseded)) = self.timers.remove(&key) {
            superseded.abort();
        }
        let deadline = self.clock.now() + delay;
        let clock = Arc::clone(&self.clock);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            clock.sleep_until(deadline).await;
            let _ = tx.send(DriverMessage::TimerElapsed { key, epoch });
        });
        self.timers.insert(key, (epoch, task.abort_handle()));
    }

    fn publish_stats(&mut self) {
        let stats = self.machine.stats();
        self.stats.publish(stats);
        if stats.queue_depth != self.last_stats.queue_depth {
            self.observer.queue_depth_changed(stats.queue_depth);
        }
        if stats.leased_streams != self.last_stats.leased_streams
            || stats.total_streams != self.last_stats.total_streams
        {
            self.observer
                .utilization_changed(stats.leased_streams, stats.total_streams);
        }
        self.last_stats = stats;
    }

    fn finish(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
        for (_, responder) in self.responders.drain() {
            let _ = responder.send(Err(PoolError::Shutdown));
        }
        self.connections.clear();
        self.stats.publish(MachineStats::default());
        debug!("pool event loop stopped");
    }
}
