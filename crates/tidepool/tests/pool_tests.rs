//! Driver-level tests: the public pool API exercised against scriptable
//! connections and a virtual clock.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use support::{CountingObserver, TestConnection, TestFactory, TestKeepAlive, eventually};
use tidepool::{
    BackoffConfig, NoKeepAlive, NoopObserver, Pool, PoolConfig, PoolError, PooledConnection,
    VirtualClock,
};
use tokio::task::JoinHandle;

fn jitterless(config: PoolConfig) -> PoolConfig {
    let backoff = config.backoff.clone().without_jitter();
    config.backoff(backoff)
}

fn start_pool(
    config: PoolConfig,
    factory: &Arc<TestFactory>,
    clock: &Arc<VirtualClock>,
) -> (Pool<TestConnection>, JoinHandle<()>) {
    let pool = Pool::with_components(
        jitterless(config),
        factory.clone(),
        Arc::new(NoKeepAlive),
        Arc::new(NoopObserver),
        clock.clone(),
    )
    .expect("valid config");
    let driver = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.run().await.expect("event loop runs once");
        })
    };
    (pool, driver)
}

async fn stop_pool(pool: &Pool<TestConnection>, driver: JoinHandle<()>) {
    pool.shutdown();
    driver.await.expect("driver task");
}

#[tokio::test]
async fn lease_release_reuses_the_connection() {
    let factory = TestFactory::new(2);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(4), &factory, &clock);

    let lease = assert_ok!(pool.lease().await);
    let first_id = lease.connection_id();
    assert_eq!(lease.connection().id(), first_id);
    eventually(|| pool.stats().leased_streams == 1).await;

    lease.release();
    eventually(|| pool.stats().idle_connections == 1).await;

    let again = pool.lease().await.expect("second lease");
    assert_eq!(again.connection_id(), first_id);
    assert_eq!(factory.connect_count(), 1, "connection was reused");

    drop(again);
    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn contended_capacity_serves_second_caller_on_release() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1), &factory, &clock);

    let held = pool.lease().await.expect("first lease");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease().await })
    };
    eventually(|| pool.stats().queued_requests == 1).await;

    held.release();
    let second = waiter
        .await
        .expect("waiter task")
        .expect("second lease after release");
    assert_eq!(factory.connect_count(), 1);

    drop(second);
    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn minimum_connections_are_created_proactively() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(4).min_connections(2), &factory, &clock);

    eventually(|| {
        let stats = pool.stats();
        stats.connections == 2 && stats.idle_connections == 2
    })
    .await;
    assert_eq!(factory.connect_count(), 2);
    assert_eq!(pool.stats().leased_streams, 0);

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn failed_attempts_retry_on_the_backoff_timer() {
    let factory = TestFactory::new(1);
    factory.push_failure("dns exploded");
    factory.push_failure("dns exploded again");
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1).min_connections(1), &factory, &clock);

    eventually(|| factory.connect_count() == 1).await;
    eventually(|| clock.sleeper_count() == 1).await;

    clock.advance(Duration::from_millis(100));
    eventually(|| factory.connect_count() == 2).await;
    eventually(|| clock.sleeper_count() == 1).await;

    clock.advance(Duration::from_millis(100));
    eventually(|| factory.connect_count() == 3).await;
    eventually(|| pool.stats().idle_connections == 1).await;

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn idle_connections_above_minimum_time_out() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let config = PoolConfig::new(2).idle_timeout(Duration::from_secs(60));
    let (pool, driver) = start_pool(config, &factory, &clock);

    let lease = pool.lease().await.expect("lease");
    lease.release();
    eventually(|| pool.stats().idle_connections == 1).await;
    eventually(|| clock.sleeper_count() == 1).await;

    clock.advance(Duration::from_secs(60));
    eventually(|| pool.stats().connections == 0).await;
    assert!(factory.connection(0).is_closed());

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn cancelled_queued_request_leaves_the_queue() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1), &factory, &clock);

    let held = pool.lease().await.expect("first lease");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease().await })
    };
    eventually(|| pool.stats().queued_requests == 1).await;

    waiter.abort();
    eventually(|| pool.stats().queued_requests == 0).await;

    // The freed capacity goes to a later caller, not the cancelled one.
    held.release();
    let next = pool.lease().await.expect("lease after cancellation");

    drop(next);
    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn cancellation_after_assignment_returns_the_stream() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1), &factory, &clock);

    // Drive a lease future just far enough to submit the request, then
    // drop it once the pool has assigned the stream but before the caller
    // ever observes the lease.
    let mut pending = Box::pin(pool.lease());
    assert!(futures::poll!(pending.as_mut()).is_pending());
    eventually(|| pool.stats().leased_streams == 1).await;

    drop(pending);
    eventually(|| {
        let stats = pool.stats();
        stats.leased_streams == 0 && stats.idle_connections == 1
    })
    .await;

    // The slot is immediately usable again.
    let lease = pool.lease().await.expect("lease after cancel");
    drop(lease);
    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn externally_closed_connection_is_replaced() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(2).min_connections(1), &factory, &clock);

    eventually(|| pool.stats().idle_connections == 1).await;

    factory.connection(0).sever();
    eventually(|| factory.connect_count() == 2).await;
    eventually(|| {
        let stats = pool.stats();
        stats.connections == 1 && stats.idle_connections == 1
    })
    .await;

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn keep_alive_probes_run_and_rearm() {
    let factory = TestFactory::new(1);
    let keep_alive = TestKeepAlive::new(Duration::from_secs(30));
    let clock = Arc::new(VirtualClock::new());
    let pool = Pool::with_components(
        jitterless(PoolConfig::new(2).min_connections(1)),
        factory.clone(),
        keep_alive.clone(),
        Arc::new(NoopObserver),
        clock.clone(),
    )
    .expect("valid config");
    let driver = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await.expect("event loop") })
    };

    eventually(|| pool.stats().idle_connections == 1).await;
    eventually(|| clock.sleeper_count() == 1).await;

    clock.advance(Duration::from_secs(30));
    eventually(|| keep_alive.probe_count() == 1).await;
    // Success re-arms the next probe.
    eventually(|| clock.sleeper_count() == 1).await;

    keep_alive.push_failure("ping lost");
    clock.advance(Duration::from_secs(30));
    eventually(|| keep_alive.probe_count() == 2).await;
    // The dead connection is closed and replaced.
    eventually(|| factory.connect_count() == 2).await;
    eventually(|| pool.stats().idle_connections == 1).await;
    assert!(factory.connection(0).is_closed());

    pool.shutdown();
    driver.await.expect("driver task");
}

#[tokio::test]
async fn disabled_keep_alive_arms_no_timers() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1).min_connections(1), &factory, &clock);

    eventually(|| pool.stats().idle_connections == 1).await;
    // At the minimum there is no idle timer either: nothing sleeps.
    assert_eq!(clock.sleeper_count(), 0);

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn run_can_only_be_called_once() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(1).min_connections(1), &factory, &clock);

    eventually(|| pool.stats().connections == 1).await;
    assert!(matches!(
        pool.run().await,
        Err(PoolError::AlreadyRunning)
    ));

    stop_pool(&pool, driver).await;
}

#[tokio::test]
async fn shutdown_rejects_new_leases_and_drains_held_ones() {
    let factory = TestFactory::new(1);
    let clock = Arc::new(VirtualClock::new());
    let (pool, driver) = start_pool(PoolConfig::new(2), &factory, &clock);

    let held = pool.lease().await.expect("lease");
    pool.shutdown();
    assert!(pool.is_shutting_down());

    let refused = pool.lease().await;
    assert!(matches!(refused, Err(PoolError::Shutdown)));

    // The in-flight lease completes normally and its release finishes the
    // drain.
    held.release();
    driver.await.expect("driver task");

    let stats = pool.stats();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.leased_streams, 0);
    assert_eq!(clock.sleeper_count(), 0);
}

#[tokio::test]
async fn observer_sees_the_lifecycle() {
    let factory = TestFactory::new(1);
    let observer = Arc::new(CountingObserver::default());
    let clock = Arc::new(VirtualClock::new());
    let pool = Pool::with_components(
        jitterless(PoolConfig::new(2)),
        factory.clone(),
        Arc::new(NoKeepAlive),
        observer.clone(),
        clock.clone(),
    )
    .expect("valid config");
    let driver = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await.expect("event loop") })
    };

    let lease = pool.lease().await.expect("lease");
    lease.release();
    eventually(|| pool.stats().idle_connections == 1).await;

    pool.shutdown();
    driver.await.expect("driver task");

    use std::sync::atomic::Ordering;
    assert_eq!(observer.connects_started.load(Ordering::SeqCst), 1);
    assert_eq!(observer.connects_succeeded.load(Ordering::SeqCst), 1);
    assert_eq!(observer.leases.load(Ordering::SeqCst), 1);
    assert_eq!(observer.releases.load(Ordering::SeqCst), 1);
    assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn factory_errors_surface_when_attempts_run_out() {
    let factory = TestFactory::new(1);
    factory.push_failure("auth rejected");
    let clock = Arc::new(VirtualClock::new());
    let config = PoolConfig::new(1).backoff(BackoffConfig {
        max_attempts: Some(1),
        jitter_factor: 0.0,
        ..BackoffConfig::default()
    });
    let (pool, driver) = start_pool(config, &factory, &clock);

    let outcome = pool.lease().await;
    match outcome {
        Err(PoolError::ConnectFailed(cause)) => {
            assert_eq!(cause.to_string(), "auth rejected");
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }

    stop_pool(&pool, driver).await;
}
