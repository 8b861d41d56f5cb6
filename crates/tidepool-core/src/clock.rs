//! Injectable time source.
//!
//! Every timer in the pool (idle timeout, keep-alive, connect backoff) sleeps
//! against a [`Clock`] rather than the ambient runtime, so tests substitute a
//! [`VirtualClock`] and advance time explicitly instead of waiting on the
//! wall clock.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A source of time and cancellable sleeps.
///
/// `sleep_until` is cancelled by dropping the returned future; an armed timer
/// that is superseded must stop consuming resources once its task is aborted.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Suspend until `deadline` has passed. Returns immediately if the
    /// deadline is already reached.
    async fn sleep_until(&self, deadline: Instant);
}

/// Production clock backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Test clock whose time only advances when told to.
///
/// `now()` is a fixed origin plus the explicitly advanced offset. Sleepers
/// register a waker and are woken by [`VirtualClock::advance`] once their
/// deadline is covered, which makes timer-driven behavior fully
/// deterministic.
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    inner: Mutex<VirtualClockInner>,
}

#[derive(Debug)]
struct VirtualClockInner {
    elapsed: Duration,
    sleepers: Vec<Sleeper>,
}

#[derive(Debug)]
struct Sleeper {
    deadline: Instant,
    waker: oneshot::Sender<()>,
}

impl VirtualClock {
    /// Create a clock frozen at its origin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Mutex::new(VirtualClockInner {
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            }),
        }
    }

    /// Advance time by `step`, waking every sleeper whose deadline is now
    /// covered.
    pub fn advance(&self, step: Duration) {
        let due = {
            let mut inner = self.inner.lock();
            inner.elapsed += step;
            let now = self.origin + inner.elapsed;
            let (due, pending) = inner
                .sleepers
                .drain(..)
                .partition(|sleeper| sleeper.deadline <= now);
            inner.sleepers = pending;
            due
        };
        for sleeper in due {
            let _ = sleeper.waker.send(());
        }
    }

    /// Number of sleeps currently waiting on this clock.
    ///
    /// Useful for asserting that no timers remain armed after shutdown.
    #[must_use]
    pub fn sleeper_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sleepers.retain(|sleeper| !sleeper.waker.is_closed());
        inner.sleepers.len()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.inner.lock().elapsed
    }

    async fn sleep_until(&self, deadline: Instant) {
        let receiver = {
            let mut inner = self.inner.lock();
            if deadline <= self.origin + inner.elapsed {
                return;
            }
            let (waker, receiver) = oneshot::channel();
            inner.sleepers.push(Sleeper { deadline, waker });
            receiver
        };
        // A dropped clock wakes the sleeper with an error; either way the
        // sleep is over.
        let _ = receiver.await;
    }
}
