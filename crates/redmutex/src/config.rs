use std::time::Duration;

/// Backend strategy used for atomic lock operations.
///
/// Both strategies implement the identical locking contract; they differ in
/// how atomicity is achieved on the server. The choice is made once per
/// runtime, never per mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Probe server-side scripting support once at setup and pick
    /// [`Strategy::Scripted`] when available, [`Strategy::Transactional`]
    /// otherwise.
    #[default]
    Auto,

    /// Optimistic `WATCH`/`MULTI` transactions. Portable to any server;
    /// expiration instants are embedded in the stored values.
    Transactional,

    /// Atomic server-side Lua procedures, one round trip per attempt;
    /// expiration uses the native per-key TTL.
    Scripted,
}

/// Configuration for a [`MutexRuntime`](crate::MutexRuntime).
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,

    /// Optional namespace prefixed to every lock name as `{ns}:{name}`.
    pub ns: Option<String>,

    /// Default per-lock expiration timeout.
    pub expire: Duration,

    /// Default wait timeout for `lock`; `None` blocks until acquired.
    pub block: Option<Duration>,

    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,

    /// Maximum number of attempts to re-establish the watcher subscription.
    /// `None` retries forever; `Some(0)` disables reconnecting.
    pub reconnect_max: Option<u32>,

    /// Default owner token shared by every mutex built from this runtime.
    /// `None` gives each mutex instance its own random token.
    pub owner: Option<String>,

    /// Backend strategy selection.
    pub strategy: Strategy,
}

/// Default per-lock expiration: one day, matching a semaphore that is held
/// for a long-running job but still reclaimable after a crash.
pub(crate) const DEFAULT_EXPIRE: Duration = Duration::from_secs(86_400);

/// Default bound on watcher reconnection attempts.
pub(crate) const DEFAULT_RECONNECT_MAX: u32 = 10;

impl MutexConfig {
    /// Create a configuration with defaults for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            ns: None,
            expire: DEFAULT_EXPIRE,
            block: None,
            pool_size: 10,
            reconnect_max: Some(DEFAULT_RECONNECT_MAX),
            owner: None,
            strategy: Strategy::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = MutexConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.ns, None);
        assert_eq!(cfg.expire, Duration::from_secs(86_400));
        assert_eq!(cfg.block, None);
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.reconnect_max, Some(10));
        assert_eq!(cfg.strategy, Strategy::Auto);
    }

    #[test]
    fn new_overrides_url_only() {
        let cfg = MutexConfig::new("redis://10.0.0.1:6380/2");
        assert_eq!(cfg.url, "redis://10.0.0.1:6380/2");
        assert_eq!(cfg.pool_size, 10);
    }
}
