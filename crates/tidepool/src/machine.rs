//! Single-pool state machine.
//!
//! A pure transition function from (current state, incoming event) to (new
//! state, list of actions). The machine performs no I/O and holds no clock:
//! timer actions carry durations and the driver owns deadlines and tasks.
//! It is also id-based (the connection objects themselves live in the
//! driver), which keeps every transition testable without mocks.
//!
//! Timers are identified by `(connection, kind)` and an epoch counter. The
//! driver aborts a timer task when it is superseded, but a fire that was
//! already in flight can still arrive afterwards; the epoch check makes such
//! stale fires harmless.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use smallvec::SmallVec;
use tidepool_core::{
    ConnectionCause, ConnectionId, ConnectionIdGenerator, PoolConfig, PoolError, RequestId,
};
use tracing::trace;

use crate::backoff::BackoffPolicy;

/// Timer purposes. At most one timer is armed per `(connection, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    IdleTimeout,
    KeepAlive,
    ConnectBackoff,
}

/// Identity of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey {
    pub(crate) connection: ConnectionId,
    pub(crate) kind: TimerKind,
}

impl TimerKey {
    pub(crate) fn new(connection: ConnectionId, kind: TimerKind) -> Self {
        Self { connection, kind }
    }
}

/// Input events applied to the machine, one at a time, in arrival order.
#[derive(Debug)]
pub(crate) enum Event {
    RequestLease(RequestId),
    CancelRequest(RequestId),
    ConnectionEstablished { id: ConnectionId, capacity: u16 },
    ConnectionFailed { id: ConnectionId, error: ConnectionCause },
    StreamReleased { id: ConnectionId },
    ConnectionClosed { id: ConnectionId },
    KeepAliveFired { id: ConnectionId, epoch: u64 },
    KeepAliveSucceeded { id: ConnectionId },
    KeepAliveFailed { id: ConnectionId, error: ConnectionCause },
    IdleTimeoutFired { id: ConnectionId, epoch: u64 },
    BackoffFired { id: ConnectionId, epoch: u64 },
    Shutdown,
}

/// Side effects the driver must execute.
#[derive(Debug)]
pub(crate) enum Action {
    /// Invoke the connection factory under a fresh id.
    CreateConnection { id: ConnectionId },
    /// Deliver a lease on `connection` to `request`.
    AssignRequest {
        request: RequestId,
        connection: ConnectionId,
    },
    /// Complete `request` with an error.
    FailRequest { request: RequestId, error: PoolError },
    /// Initiate close on the connection.
    CloseConnection { id: ConnectionId },
    /// Run a keep-alive probe on the connection.
    RunKeepAlive { id: ConnectionId },
    /// Arm (or re-arm, superseding any previous timer for the key) a timer
    /// firing after `delay`.
    ScheduleTimer {
        key: TimerKey,
        epoch: u64,
        delay: Duration,
    },
    /// Abort the timer for the key, if one is armed.
    CancelTimer { key: TimerKey },
    /// Shutdown has fully drained; the event loop can stop.
    ShutdownComplete,
}

/// Per-event action list. Most events produce at most a couple of actions.
pub(crate) type Actions = SmallVec<[Action; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    Running,
    ShuttingDown,
}

#[derive(Debug)]
enum Slot {
    /// Factory call in flight.
    Starting { attempts: u32 },
    /// Last attempt failed; waiting for the retry timer.
    Backoff { attempts: u32 },
    /// Established and usable.
    Live { capacity: u16, leased: u16 },
    /// Close requested; waiting for outstanding streams to drain and the
    /// transport to report closure.
    Closing { draining: u16 },
}

/// Read-only counters derived from the machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct MachineStats {
    pub(crate) connections: usize,
    pub(crate) idle_connections: usize,
    pub(crate) leased_streams: usize,
    pub(crate) total_streams: usize,
    pub(crate) queue_depth: usize,
}

/// The single-pool state machine.
#[derive(Debug)]
pub(crate) struct PoolMachine {
    config: PoolConfig,
    backoff: BackoffPolicy,
    keep_alive_frequency: Option<Duration>,
    ids: std::sync::Arc<ConnectionIdGenerator>,
    connections: BTreeMap<ConnectionId, Slot>,
    queue: VecDeque<RequestId>,
    timers: HashMap<TimerKey, u64>,
    next_epoch: u64,
    phase: PoolPhase,
}

impl PoolMachine {
    pub(crate) fn new(
        config: PoolConfig,
        keep_alive_frequency: Option<Duration>,
        ids: std::sync::Arc<ConnectionIdGenerator>,
    ) -> Self {
        let backoff = BackoffPolicy::new(config.backoff.clone());
        Self {
            config,
            backoff,
            keep_alive_frequency,
            ids,
            connections: BTreeMap::new(),
            queue: VecDeque::new(),
            timers: HashMap::new(),
            next_epoch: 0,
            phase: PoolPhase::Running,
        }
    }

    /// Proactive startup work: bring the pool up to its configured minimum.
    pub(crate) fn bootstrap(&mut self) -> Actions {
        let mut actions = Actions::new();
        self.ensure_minimum(&mut actions);
        actions
    }

    /// Apply one event and return the side effects to execute.
    pub(crate) fn apply(&mut self, event: Event) -> Actions {
        let mut actions = Actions::new();
        match event {
            Event::RequestLease(request) => self.request_lease(request, &mut actions),
            Event::CancelRequest(request) => self.cancel_request(request, &mut actions),
            Event::ConnectionEstablished { id, capacity } => {
                self.connection_established(id, capacity, &mut actions);
            }
            Event::ConnectionFailed { id, error } => {
                self.connection_failed(id, &error, &mut actions);
            }
            Event::StreamReleased { id } => self.stream_released(id, &mut actions),
            Event::ConnectionClosed { id } => self.connection_closed(id, &mut actions),
            Event::KeepAliveFired { id, epoch } => self.keep_alive_fired(id, epoch, &mut actions),
            Event::KeepAliveSucceeded { id } => self.keep_alive_succeeded(id, &mut actions),
            Event::KeepAliveFailed { id, .. } => self.keep_alive_failed(id, &mut actions),
            Event::IdleTimeoutFired { id, epoch } => {
                self.idle_timeout_fired(id, epoch, &mut actions);
            }
            Event::BackoffFired { id, epoch } => self.backoff_fired(id, epoch, &mut actions),
            Event::Shutdown => self.shutdown(&mut actions),
        }
        actions
    }

    pub(crate) fn stats(&self) -> MachineStats {
        let mut stats = MachineStats {
            connections: self.connections.len(),
            queue_depth: self.queue.len(),
            ..MachineStats::default()
        };
        for slot in self.connections.values() {
            if let Slot::Live { capacity, leased } = slot {
                stats.total_streams += usize::from(*capacity);
                stats.leased_streams += usize::from(*leased);
                if *leased == 0 {
                    stats.idle_connections += 1;
                }
            }
        }
        stats
    }

    // ---- event handlers -------------------------------------------------

    fn request_lease(&mut self, request: RequestId, actions: &mut Actions) {
        if self.phase == PoolPhase::ShuttingDown {
            actions.push(Action::FailRequest {
                request,
                error: PoolError::Shutdown,
            });
            return;
        }

        if let Some(id) = self.find_lease_target() {
            self.lease_stream(id, request, actions);
            return;
        }

        // No spare capacity anywhere: queue, and grow if the hard limit
        // still allows it.
        self.queue.push_back(request);
        if self.connections.len() < self.config.hard_max_connections {
            self.create_slot(actions);
        }
    }

    fn cancel_request(&mut self, request: RequestId, actions: &mut Actions) {
        if let Some(position) = self.queue.iter().position(|queued| *queued == request) {
            self.queue.remove(position);
            actions.push(Action::FailRequest {
                request,
                error: PoolError::RequestCancelled,
            });
        }
        // Not queued: the request was already assigned or completed. An
        // assigned-but-undelivered lease is returned by the driver through
        // the normal release path.
    }

    fn connection_established(&mut self, id: ConnectionId, capacity: u16, actions: &mut Actions) {
        let capacity = capacity.max(1);
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        debug_assert!(matches!(slot, Slot::Starting { .. }));

        if self.phase == PoolPhase::ShuttingDown {
            *slot = Slot::Closing { draining: 0 };
            actions.push(Action::CloseConnection { id });
            return;
        }

        let mut leased: u16 = 0;
        while leased < capacity {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            leased += 1;
            actions.push(Action::AssignRequest {
                request,
                connection: id,
            });
        }
        *slot = Slot::Live { capacity, leased };
        trace!(%id, capacity, leased, "connection established");

        if leased == 0 {
            self.enter_idle(id, actions);
        }
    }

    fn connection_failed(&mut self, id: ConnectionId, error: &ConnectionCause, actions: &mut Actions) {
        let attempts = match self.connections.get(&id) {
            Some(Slot::Starting { attempts }) => attempts + 1,
            _ => return,
        };

        if self.phase == PoolPhase::ShuttingDown {
            self.connections.remove(&id);
            self.check_shutdown_complete(actions);
            return;
        }

        if self.backoff.attempts_exhausted(attempts) {
            // The slot gives up. Queued requests only fail once no other
            // creation path remains; otherwise they keep waiting.
            self.connections.remove(&id);
            if !self.has_pending_creation() && self.find_lease_target().is_none() {
                for request in self.queue.drain(..) {
                    actions.push(Action::FailRequest {
                        request,
                        error: PoolError::ConnectFailed(error.clone()),
                    });
                }
            }
            return;
        }

        self.connections.insert(id, Slot::Backoff { attempts });
        let eager = self.live_connection_count() < self.config.min_connections
            || !self.queue.is_empty();
        let delay = if eager {
            self.backoff.eager_delay()
        } else {
            self.backoff.delay(attempts)
        };
        trace!(%id, attempts, ?delay, eager, "connection attempt failed, backing off");
        self.arm_timer(TimerKey::new(id, TimerKind::ConnectBackoff), delay, actions);
    }

    fn stream_released(&mut self, id: ConnectionId, actions: &mut Actions) {
        let now_idle = match self.connections.get_mut(&id) {
            Some(Slot::Live { capacity, leased }) => {
                debug_assert!(*leased > 0);
                *leased = leased.saturating_sub(1);

                // Earliest-enqueued request wins the freed slot.
                while *leased < *capacity {
                    let Some(request) = self.queue.pop_front() else {
                        break;
                    };
                    *leased += 1;
                    actions.push(Action::AssignRequest {
                        request,
                        connection: id,
                    });
                }
                *leased == 0
            }
            Some(Slot::Closing { draining }) => {
                *draining = draining.saturating_sub(1);
                if *draining == 0 {
                    actions.push(Action::CloseConnection { id });
                }
                false
            }
            // Connection already gone (closed while leased): nothing to
            // return the slot to.
            _ => false,
        };
        if now_idle {
            self.enter_idle(id, actions);
        }
    }

    fn connection_closed(&mut self, id: ConnectionId, actions: &mut Actions) {
        if self.connections.remove(&id).is_none() {
            return;
        }
        self.cancel_connection_timers(id, actions);

        if self.phase == PoolPhase::ShuttingDown {
            self.check_shutdown_complete(actions);
            return;
        }

        self.ensure_minimum(actions);
        if !self.queue.is_empty()
            && !self.has_pending_creation()
            && self.connections.len() < self.config.hard_max_connections
        {
            self.create_slot(actions);
        }
    }

    fn keep_alive_fired(&mut self, id: ConnectionId, epoch: u64, actions: &mut Actions) {
        if !self.accept_timer_fire(TimerKey::new(id, TimerKind::KeepAlive), epoch) {
            return;
        }
        if matches!(self.connections.get(&id), Some(Slot::Live { leased: 0, .. })) {
            actions.push(Action::RunKeepAlive { id });
        }
    }

    fn keep_alive_succeeded(&mut self, id: ConnectionId, actions: &mut Actions) {
        if self.phase == PoolPhase::ShuttingDown {
            return;
        }
        // Re-arm only while the connection is still idle; a connection that
        // was leased in the meantime gets a fresh timer when it next idles.
        if matches!(self.connections.get(&id), Some(Slot::Live { leased: 0, .. })) {
            if let Some(frequency) = self.keep_alive_frequency {
                self.arm_timer(TimerKey::new(id, TimerKind::KeepAlive), frequency, actions);
            }
        }
    }

    fn keep_alive_failed(&mut self, id: ConnectionId, actions: &mut Actions) {
        let Some(Slot::Live { leased, .. }) = self.connections.get(&id) else {
            return;
        };
        let draining = *leased;
        self.cancel_connection_timers(id, actions);
        self.connections.insert(id, Slot::Closing { draining });
        if draining == 0 {
            actions.push(Action::CloseConnection { id });
        }

        if self.phase == PoolPhase::Running {
            // Replace the dead transport right away rather than waiting for
            // it to finish draining.
            let usable = self
                .connections
                .values()
                .filter(|slot| !matches!(slot, Slot::Closing { .. }))
                .count();
            if usable < self.config.min_connections
                && self.connections.len() < self.config.hard_max_connections
            {
                self.create_slot(actions);
            }
        }
    }

    fn idle_timeout_fired(&mut self, id: ConnectionId, epoch: u64, actions: &mut Actions) {
        if !self.accept_timer_fire(TimerKey::new(id, TimerKind::IdleTimeout), epoch) {
            return;
        }
        let still_idle = matches!(self.connections.get(&id), Some(Slot::Live { leased: 0, .. }));
        if still_idle && self.connections.len() > self.config.min_connections {
            self.close_idle_connection(id, actions);
        }
    }

    fn backoff_fired(&mut self, id: ConnectionId, epoch: u64, actions: &mut Actions) {
        if !self.accept_timer_fire(TimerKey::new(id, TimerKind::ConnectBackoff), epoch) {
            return;
        }
        let Some(Slot::Backoff { attempts }) = self.connections.get(&id) else {
            return;
        };
        let attempts = *attempts;
        // Retries run under a fresh id: connection ids are issued once and
        // never reused, including across retries of the same slot.
        self.connections.remove(&id);
        let retry_id = self.ids.next_id();
        self.connections.insert(retry_id, Slot::Starting { attempts });
        actions.push(Action::CreateConnection { id: retry_id });
    }

    fn shutdown(&mut self, actions: &mut Actions) {
        if self.phase == PoolPhase::ShuttingDown {
            return;
        }
        self.phase = PoolPhase::ShuttingDown;

        for request in self.queue.drain(..) {
            actions.push(Action::FailRequest {
                request,
                error: PoolError::Shutdown,
            });
        }
        for (key, _) in self.timers.drain() {
            actions.push(Action::CancelTimer { key });
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.connections.get(&id) else {
                continue;
            };
            match slot {
                Slot::Live { leased, .. } => {
                    let draining = *leased;
                    self.connections.insert(id, Slot::Closing { draining });
                    if draining == 0 {
                        actions.push(Action::CloseConnection { id });
                    }
                }
                // Backoff slots have nothing to close; starting slots are
                // closed as soon as the factory call resolves.
                Slot::Backoff { .. } => {
                    self.connections.remove(&id);
                }
                Slot::Starting { .. } | Slot::Closing { .. } => {}
            }
        }
        self.check_shutdown_complete(actions);
    }

    // ---- helpers --------------------------------------------------------

    /// Packing scan: prefer the most-loaded connection that still has a
    /// spare stream, so multiplexing consolidates and idle connections can
    /// age out. Idle connections are used only when no leased connection
    /// has room.
    fn find_lease_target(&self) -> Option<ConnectionId> {
        let mut best: Option<(ConnectionId, u16)> = None;
        let mut first_idle: Option<ConnectionId> = None;
        for (&id, slot) in &self.connections {
            let Slot::Live { capacity, leased } = slot else {
                continue;
            };
            if leased >= capacity {
                continue;
            }
            if *leased == 0 {
                first_idle.get_or_insert(id);
            } else if best.is_none_or(|(_, load)| *leased > load) {
                best = Some((id, *leased));
            }
        }
        best.map(|(id, _)| id).or(first_idle)
    }

    fn lease_stream(&mut self, id: ConnectionId, request: RequestId, actions: &mut Actions) {
        let Some(Slot::Live { leased, capacity }) = self.connections.get_mut(&id) else {
            return;
        };
        debug_assert!(*leased < *capacity);
        let was_idle = *leased == 0;
        *leased += 1;
        if was_idle {
            self.cancel_timer(TimerKey::new(id, TimerKind::IdleTimeout), actions);
            self.cancel_timer(TimerKey::new(id, TimerKind::KeepAlive), actions);
        }
        actions.push(Action::AssignRequest {
            request,
            connection: id,
        });
    }

    /// Idle policy for a connection whose leased count just hit zero:
    /// above the soft limit it is closed outright, above the minimum it is
    /// given an idle timer, and at or below the minimum it is kept alive.
    fn enter_idle(&mut self, id: ConnectionId, actions: &mut Actions) {
        let total = self.connections.len();
        let above_min = total > self.config.min_connections;
        if above_min && total > self.config.soft_max_connections {
            self.close_idle_connection(id, actions);
        } else if above_min {
            self.arm_timer(
                TimerKey::new(id, TimerKind::IdleTimeout),
                self.config.idle_timeout,
                actions,
            );
        } else if let Some(frequency) = self.keep_alive_frequency {
            self.arm_timer(TimerKey::new(id, TimerKind::KeepAlive), frequency, actions);
        }
    }

    fn close_idle_connection(&mut self, id: ConnectionId, actions: &mut Actions) {
        self.cancel_connection_timers(id, actions);
        self.connections.insert(id, Slot::Closing { draining: 0 });
        actions.push(Action::CloseConnection { id });
    }

    fn create_slot(&mut self, actions: &mut Actions) {
        let id = self.ids.next_id();
        self.connections.insert(id, Slot::Starting { attempts: 0 });
        actions.push(Action::CreateConnection { id });
    }

    /// Grow until the minimum holds, within the hard limit.
    fn ensure_minimum(&mut self, actions: &mut Actions) {
        if self.phase == PoolPhase::ShuttingDown {
            return;
        }
        while self.connections.len() < self.config.min_connections
            && self.connections.len() < self.config.hard_max_connections
        {
            self.create_slot(actions);
        }
    }

    fn live_connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    fn has_pending_creation(&self) -> bool {
        self.connections
            .values()
            .any(|slot| matches!(slot, Slot::Starting { .. } | Slot::Backoff { .. }))
    }

    fn arm_timer(&mut self, key: TimerKey, delay: Duration, actions: &mut Actions) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.timers.insert(key, epoch);
        actions.push(Action::ScheduleTimer { key, epoch, delay });
    }

    fn cancel_timer(&mut self, key: TimerKey, actions: &mut Actions) {
        if self.timers.remove(&key).is_some() {
            actions.push(Action::CancelTimer { key });
        }
    }

    fn cancel_connection_timers(&mut self, id: ConnectionId, actions: &mut Actions) {
        for kind in [
            TimerKind::IdleTimeout,
            TimerKind::KeepAlive,
            TimerKind::ConnectBackoff,
        ] {
            self.cancel_timer(TimerKey::new(id, kind), actions);
        }
    }

    /// A fire is accepted only if the machine still expects this exact
    /// timer; superseded or cancelled timers are ignored.
    fn accept_timer_fire(&mut self, key: TimerKey, epoch: u64) -> bool {
        if self.timers.get(&key) == Some(&epoch) {
            self.timers.remove(&key);
            true
        } else {
            false
        }
    }

    fn check_shutdown_complete(&self, actions: &mut Actions) {
        if self.phase == PoolPhase::ShuttingDown && self.connections.is_empty() {
            actions.push(Action::ShutdownComplete);
        }
    }
}
