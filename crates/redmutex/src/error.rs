use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during mutex operations.
#[derive(Debug, Error)]
pub enum MutexError {
    /// The runtime was misconfigured or used after teardown.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller attempted to re-acquire a lock it already owns.
    #[error("deadlock; recursive locking by {0}")]
    Deadlock(String),

    /// The block timeout elapsed before the lock could be acquired.
    ///
    /// Only `synchronize` and `sleep` surface this as an error; `lock` and
    /// `try_lock` report the same condition as a plain `false`.
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),

    /// A connection to the Redis server could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// An error from the Redis server or protocol layer.
    #[error("backend error: {0}")]
    Backend(String),

    /// The release-notification watcher could not be established.
    #[error("watcher unavailable: {0}")]
    Watcher(String),

    /// `stop_watcher` was refused because tasks are still blocked in `lock`.
    #[error("cannot stop watcher: {0} waiters still registered")]
    ActiveWaiters(usize),
}

impl From<redis::RedisError> for MutexError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for MutexError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_duration() {
        let err = MutexError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn active_waiters_message_includes_count() {
        let err = MutexError::ActiveWaiters(3);
        assert_eq!(
            err.to_string(),
            "cannot stop watcher: 3 waiters still registered"
        );
    }
}
