//! Distributed mutex over Redis for cooperatively scheduled tasks.
//!
//! This crate provides a cross-process, cross-machine mutual-exclusion
//! primitive: many processes agree that at most one owner at a time holds a
//! named lock (or an atomic set of named locks), with expiration-based crash
//! recovery and pub/sub-driven wakeup of waiters instead of busy polling.
//!
//! # Features
//!
//! - **Two interchangeable backends**: optimistic `WATCH`/`MULTI`
//!   transactions, or atomic server-side Lua procedures (one round trip per
//!   attempt); auto-detected at setup.
//! - **Multi-key locks**: an atomic all-or-nothing set of names.
//! - **Crash recovery**: an abandoned lock is reclaimed by the next
//!   contender once its expiration passes.
//! - **Near-instant wakeup**: one release-channel subscription per runtime
//!   wakes local waiters the moment a lock is freed.
//! - **Connection pooling**: store access is bounded by a `deadpool-redis`
//!   pool; excess callers queue FIFO.
//!
//! # Consistency
//!
//! Mutual exclusion is enforced entirely by the shared server's atomic
//! primitives. Against a single instance that guarantee is strong; with
//! asynchronous replication (Sentinel/Cluster) a failover can lose a freshly
//! acquired lock, so treat the lock as best-effort coordination there.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use redmutex::{Mutex, MutexConfig, MutexOptions, MutexRuntime};
//!
//! let runtime = MutexRuntime::setup(MutexConfig::new("redis://localhost:6379")).await?;
//!
//! let mutex = Mutex::new(
//!     &runtime,
//!     ["resource"],
//!     MutexOptions::default().with_expire(Duration::from_secs(30)),
//! )?;
//!
//! mutex.synchronize(|| async {
//!     // critical section
//! }).await?;
//! ```

mod config;
mod error;
mod ident;
mod mutex;
mod ns;
mod pool;
mod runtime;
mod scripted;
mod scripts;
mod strategy;
pub mod testing;
mod transactional;
mod waiters;
mod watcher;

pub use config::{MutexConfig, Strategy};
pub use error::MutexError;
pub use mutex::{Mutex, MutexOptions, RefreshOutcome};
pub use ns::Namespace;
pub use runtime::MutexRuntime;
pub use watcher::WatcherState;
