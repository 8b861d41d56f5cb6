//! # Tidepool Core
//!
//! Foundation crate for the tidepool connection pool providing identifiers,
//! error types, configuration, the injectable clock, and the observability
//! contract.
//!
//! ## Module Organization
//!
//! ```text
//! tidepool-core/
//! ├── types/          # Connection and request identifiers
//! ├── error/          # Error taxonomy
//! ├── config/         # Pool, backoff and manager configuration
//! ├── clock/          # Clock trait, SystemClock, VirtualClock
//! └── observer/       # PoolObserver sink contract
//! ```
//!
//! ## Usage
//!
//! This crate holds the pieces shared between the pool and its embedders.
//! It is typically not used directly but imported through the main
//! `tidepool` crate.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod observer;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::{BackoffConfig, ManagerConfig, PoolConfig};
pub use error::{ConfigError, ConnectionCause, PoolError, PoolResult};
pub use observer::{NoopObserver, PoolObserver, TracingObserver};
pub use types::{ConnectionId, ConnectionIdGenerator, RequestId, RequestIdGenerator};
