//! # Tidepool
//!
//! A generic, protocol-agnostic connection pool for clients that multiplex
//! logical streams over reusable network connections.
//!
//! The pool decides when to create, reuse, multiplex, idle-evict,
//! keep-alive and destroy connections, and satisfies a FIFO queue of lease
//! requests that may exceed available capacity. It is agnostic to what a
//! connection actually transports: wire protocols, authentication and the
//! physical transport live behind the [`ConnectionFactory`] and
//! [`PooledConnection`] contracts.
//!
//! ## Architecture
//!
//! ```text
//! tidepool/
//! ├── core/           # Collaborator contracts (connection, factory, keep-alive)
//! ├── machine/        # Pure single-pool state machine
//! ├── driver/         # Event loop executing machine decisions
//! ├── lease/          # Lease guard with release-on-drop
//! ├── backoff/        # Connect retry policy
//! └── manager/        # Multi-executor sharding and affinity routing
//! ```
//!
//! Each pool's mutable state has exactly one owner: an event loop consuming
//! an ordered channel of events. Callers interact through cheap cloneable
//! handles; `lease()` suspends until capacity is available, releasing a
//! [`Lease`] never suspends. All timers run against an injected
//! [`Clock`], so tests drive idle-timeout, keep-alive and backoff behavior
//! deterministically with a virtual clock.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = Pool::new(PoolConfig::new(8), Arc::new(MyFactory::default()))?;
//! let driver = { let pool = pool.clone(); tokio::spawn(async move { pool.run().await }) };
//!
//! let lease = pool.lease().await?;
//! // ... use lease.connection() ...
//! lease.release();
//!
//! pool.shutdown();
//! driver.await;
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod core;
mod backoff;
mod driver;
mod lease;
mod machine;
mod manager;

// Re-export commonly used types
pub use crate::core::{BoxError, ConnectionFactory, Established, KeepAlive, NoKeepAlive, PooledConnection};
pub use driver::{Pool, PoolStats};
pub use lease::Lease;
pub use manager::{ExecutorContext, PoolManager};

pub use tidepool_core::{
    BackoffConfig, Clock, ConfigError, ConnectionCause, ConnectionId, ManagerConfig, NoopObserver,
    PoolConfig, PoolError, PoolObserver, PoolResult, RequestId, SystemClock, TracingObserver,
    VirtualClock,
};
