//! Bounded connection pool over the shared store.
//!
//! The pool serializes store access among suspended callers: a checkout hands
//! one connection to exactly one task, excess callers queue FIFO, and the
//! connection returns to the pool on drop regardless of how the caller's
//! scope exits. There is no checkout timeout; lock operations bound their
//! own waiting through the retry loop, not the pool.

use deadpool_redis::{Config, Pool, Runtime};

use crate::error::MutexError;

/// Build a fixed-size connection pool for the given server URL.
pub(crate) fn build(url: &str, size: usize) -> Result<Pool, MutexError> {
    if size == 0 {
        return Err(MutexError::Configuration(
            "pool_size must be at least 1".into(),
        ));
    }
    let cfg = Config::from_url(url);
    cfg.builder()
        .map(|b| b.max_size(size).runtime(Runtime::Tokio1).build())
        .map_err(|e| MutexError::Connection(e.to_string()))?
        .map_err(|e| MutexError::Connection(e.to_string()))
}

/// Obtain a connection from the pool, suspending until one frees up.
pub(crate) async fn conn(pool: &Pool) -> Result<deadpool_redis::Connection, MutexError> {
    pool.get().await.map_err(MutexError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pool_size_is_rejected() {
        let err = build("redis://127.0.0.1:6379", 0).unwrap_err();
        assert!(matches!(err, MutexError::Configuration(_)));
    }

    #[test]
    fn pool_builds_without_connecting() {
        // deadpool creates connections lazily; building the pool itself
        // must not require a reachable server.
        let pool = build("redis://127.0.0.1:1", 2).expect("pool should build");
        assert_eq!(pool.status().max_size, 2);
    }
}
