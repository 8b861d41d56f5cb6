//! Multi-executor pool manager.
//!
//! Maintains one pool per execution context so the hot path never crosses
//! a context boundary. The executor set is injected explicitly, with no
//! ambient global runtime lookup, and each shard receives an even share
//! of the global connection limits. Routing prefers the caller's own shard
//! (affinity) and falls back to the least-loaded shard using read-mostly,
//! eventually-consistent counters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tidepool_core::{
    Clock, ConfigError, ConnectionIdGenerator, ManagerConfig, NoopObserver, PoolObserver,
    PoolResult, SystemClock,
};
use tracing::{debug, warn};

use crate::core::{ConnectionFactory, KeepAlive, NoKeepAlive, PooledConnection};
use crate::driver::{Pool, PoolStats};
use crate::lease::Lease;

/// The execution context a caller is running on, used for affinity routing.
///
/// Contexts are explicit values handed out by the manager rather than an
/// ambient thread-local lookup, which keeps routing a pure function of its
/// inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorContext {
    shard: usize,
}

impl ExecutorContext {
    /// Context for the given shard index.
    #[must_use]
    pub fn new(shard: usize) -> Self {
        Self { shard }
    }

    /// The shard index this context maps to.
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard
    }
}

struct Shard<C>
where
    C: PooledConnection,
{
    pool: Pool<C>,
    executor: tokio::runtime::Handle,
    /// Lease requests routed here that have not completed yet. Bridges the
    /// window between a routing decision and the pool's own stats catching
    /// up, so a burst of concurrent requests spreads instead of piling onto
    /// one shard.
    demand: AtomicUsize,
    hard_limit: usize,
}

impl<C> Shard<C>
where
    C: PooledConnection,
{
    fn load(&self) -> usize {
        self.demand.load(Ordering::Relaxed) + self.pool.stats().leased_streams
    }

    fn has_headroom(&self) -> bool {
        let stats = self.pool.stats();
        let demand = self.demand.load(Ordering::Relaxed);
        stats.queued_requests == 0
            && (stats.leased_streams + demand < stats.total_streams
                || stats.connections < self.hard_limit)
    }
}

/// Shards one logical pool across a set of executors.
pub struct PoolManager<C>
where
    C: PooledConnection,
{
    inner: Arc<ManagerInner<C>>,
}

impl<C> Clone for PoolManager<C>
where
    C: PooledConnection,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ManagerInner<C>
where
    C: PooledConnection,
{
    shards: Vec<Shard<C>>,
}

impl<C> PoolManager<C>
where
    C: PooledConnection,
{
    /// Create a manager with default keep-alive (none), observer (none) and
    /// clock (system).
    pub fn new(
        config: ManagerConfig,
        executors: Vec<tokio::runtime::Handle>,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Result<Self, ConfigError> {
        Self::with_components(
            config,
            executors,
            factory,
            Arc::new(NoKeepAlive),
            Arc::new(NoopObserver),
            Arc::new(SystemClock),
        )
    }

    /// Create a manager with every collaborator injected explicitly.
    ///
    /// One pool is created per executor, each configured with an even share
    /// of the global limits; connection ids stay unique across shards.
    pub fn with_components(
        config: ManagerConfig,
        executors: Vec<tokio::runtime::Handle>,
        factory: Arc<dyn ConnectionFactory<C>>,
        keep_alive: Arc<dyn KeepAlive<C>>,
        observer: Arc<dyn PoolObserver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if executors.is_empty() {
            return Err(ConfigError::NoExecutors);
        }
        config.validate()?;

        let ids = Arc::new(ConnectionIdGenerator::new());
        let shard_count = executors.len();
        let mut shards = Vec::with_capacity(shard_count);
        for (index, executor) in executors.into_iter().enumerate() {
            let shard_config = config.shard_config(index, shard_count);
            let hard_limit = shard_config.hard_max_connections;
            let pool = Pool::build(
                shard_config,
                Arc::clone(&factory),
                Arc::clone(&keep_alive),
                Arc::clone(&observer),
                Arc::clone(&clock),
                Arc::clone(&ids),
            )?;
            shards.push(Shard {
                pool,
                executor,
                demand: AtomicUsize::new(0),
                hard_limit,
            });
        }
        debug!(shards = shard_count, "pool manager created");
        Ok(Self {
            inner: Arc::new(ManagerInner { shards }),
        })
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// The execution contexts this manager routes over, one per shard.
    #[must_use]
    pub fn executor_contexts(&self) -> Vec<ExecutorContext> {
        (0..self.inner.shards.len()).map(ExecutorContext::new).collect()
    }

    /// Borrow a stream slot from the shard matching `context`, or from the
    /// least-loaded shard when the caller has no affinity or its shard is
    /// saturated while another has room.
    pub async fn lease(&self, context: Option<ExecutorContext>) -> PoolResult<Lease<C>> {
        let shard = &self.inner.shards[self.route(context)];
        shard.demand.fetch_add(1, Ordering::Relaxed);
        let demand_guard = DecrementOnDrop(&shard.demand);
        let result = shard.pool.lease().await;
        drop(demand_guard);
        result
    }

    /// Lease a connection, run `operation` on it, and release the lease on
    /// every exit path, including errors, panics and cancellation.
    pub async fn with_connection<F, Fut, T>(
        &self,
        context: Option<ExecutorContext>,
        operation: F,
    ) -> PoolResult<T>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lease(context).await?;
        let connection = lease.connection().clone();
        let output = operation(connection).await;
        lease.release();
        Ok(output)
    }

    /// Start every shard's driver concurrently; returns once all of them
    /// have stopped after a global shutdown.
    pub async fn run(&self) -> PoolResult<()> {
        let mut drivers = Vec::with_capacity(self.inner.shards.len());
        for shard in &self.inner.shards {
            let pool = shard.pool.clone();
            drivers.push(shard.executor.spawn(async move { pool.run().await }));
        }

        let mut outcome = Ok(());
        for joined in join_all(drivers).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => outcome = Err(error),
                Err(join_error) => {
                    warn!(%join_error, "pool driver task failed");
                }
            }
        }
        outcome
    }

    /// Request a graceful shutdown of every shard. Idempotent.
    pub fn shutdown(&self) {
        for shard in &self.inner.shards {
            shard.pool.shutdown();
        }
    }

    /// Per-shard statistics, indexed by shard.
    #[must_use]
    pub fn shard_stats(&self) -> Vec<PoolStats> {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.pool.stats())
            .collect()
    }

    /// Statistics aggregated across all shards.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for shard in &self.inner.shards {
            let stats = shard.pool.stats();
            total.connections += stats.connections;
            total.idle_connections += stats.idle_connections;
            total.leased_streams += stats.leased_streams;
            total.total_streams += stats.total_streams;
            total.queued_requests += stats.queued_requests;
        }
        total
    }

    fn route(&self, context: Option<ExecutorContext>) -> usize {
        if let Some(context) = context {
            if let Some(shard) = self.inner.shards.get(context.shard()) {
                if shard.has_headroom() {
                    return context.shard();
                }
            }
        }
        self.least_loaded()
    }

    /// Lowest-indexed shard among those with minimal load.
    fn least_loaded(&self) -> usize {
        self.inner
            .shards
            .iter()
            .enumerate()
            .min_by_key(|(_, shard)| shard.load())
            .map_or(0, |(index, _)| index)
    }
}

impl<C> fmt::Debug for PoolManager<C>
where
    C: PooledConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("shards", &self.inner.shards.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

struct DecrementOnDrop<'a>(&'a AtomicUsize);

impl Drop for DecrementOnDrop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
