//! The backend contract shared by both lock strategies.

use async_trait::async_trait;

use crate::error::MutexError;

/// Outcome of one acquisition attempt inside the blocking loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Attempt {
    /// Every key was taken; `stored` is the exact value now in the store,
    /// kept for later ownership checks.
    Acquired { stored: String },

    /// A current holder's identity equals the caller's own.
    Deadlock,

    /// Held by someone else; `retry_at` is the epoch instant at which the
    /// nearest conflicting holder expires.
    Busy { retry_at: f64 },
}

/// Atomic lock operations against the shared store.
///
/// Implementations must make every multi-key operation all-or-nothing; a
/// failed attempt may not leave any key newly set. The two implementations
/// ([`TransactionalStrategy`](crate::transactional::TransactionalStrategy)
/// and [`ScriptedStrategy`](crate::scripted::ScriptedStrategy)) satisfy the
/// identical contract and are selected once per runtime.
#[async_trait]
pub(crate) trait LockStrategy: Send + Sync {
    /// Non-blocking attempt: set all keys iff all are absent. Returns the
    /// stored value on success.
    async fn try_lock(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError>;

    /// One attempt of the blocking loop: try to take the keys, detect
    /// recursive acquisition, reclaim expired holders, and report when the
    /// nearest surviving holder expires.
    async fn acquire(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Attempt, MutexError>;

    /// Extend the expiration of a held lock. Returns the new stored value,
    /// or `None` if the caller no longer owns every key (any partially owned
    /// subset has been cleared).
    async fn refresh(
        &self,
        keys: &[String],
        stored: &str,
        ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError>;

    /// Delete all keys iff every value still equals `stored`, publishing a
    /// release notification on success. Returns whether the deletion
    /// happened.
    async fn unlock(&self, keys: &[String], stored: &str) -> Result<bool, MutexError>;

    /// Whether at least one key currently exists, whoever owns it.
    async fn is_locked(&self, keys: &[String]) -> Result<bool, MutexError>;

    /// Current raw values of all keys, for authoritative ownership checks.
    async fn current_values(&self, keys: &[String]) -> Result<Vec<Option<String>>, MutexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify object safety; the runtime stores the strategy as a trait
    // object.
    fn _assert_dyn_lock_strategy(_: &dyn LockStrategy) {}
}
