//! Process-wide runtime state.
//!
//! A [`MutexRuntime`] owns everything shared by the mutexes built from it:
//! the connection pool, the resolved backend strategy, the waiter registry,
//! the release-channel watcher and the per-runtime uuid that prefixes every
//! owner identity. It is an explicit object injected into
//! [`Mutex`](crate::Mutex) constructors. Reconfiguring means building a new
//! runtime; the old watcher dies when its runtime is stopped or dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{MutexConfig, Strategy};
use crate::error::MutexError;
use crate::pool;
use crate::scripted::ScriptedStrategy;
use crate::strategy::LockStrategy;
use crate::transactional::TransactionalStrategy;
use crate::waiters::WaiterRegistry;
use crate::watcher::{Watcher, WatcherState};

pub struct MutexRuntime {
    uuid: String,
    ns: Option<String>,
    default_expire: Duration,
    default_block: Option<Duration>,
    default_owner: Option<String>,
    strategy_kind: Strategy,
    strategy: Box<dyn LockStrategy>,
    waiters: Arc<WaiterRegistry>,
    watcher: Watcher,
    auto_name: AtomicU64,
}

impl std::fmt::Debug for MutexRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexRuntime")
            .field("uuid", &self.uuid)
            .field("ns", &self.ns)
            .field("default_expire", &self.default_expire)
            .field("default_block", &self.default_block)
            .field("default_owner", &self.default_owner)
            .field("strategy_kind", &self.strategy_kind)
            .finish_non_exhaustive()
    }
}

impl MutexRuntime {
    /// Connect to the server, resolve the backend strategy and establish the
    /// release-channel subscription. Must complete before any mutex is
    /// constructed.
    ///
    /// # Errors
    ///
    /// Returns [`MutexError::Connection`] if the server is unreachable and
    /// [`MutexError::Watcher`] if the release channel cannot be established
    /// within the configured reconnect bound.
    pub async fn setup(config: MutexConfig) -> Result<Arc<Self>, MutexError> {
        if let Some(owner) = &config.owner {
            crate::ident::validate_owner_token(owner)?;
        }
        let pool = pool::build(&config.url, config.pool_size)?;
        let resolved = match config.strategy {
            Strategy::Auto => Self::probe_scripting(&pool).await?,
            explicit => explicit,
        };

        let runtime = Self::build(config, resolved, pool)?;
        runtime.watcher.start();
        runtime.watcher.wait_subscribed().await?;
        info!(strategy = ?resolved, "mutex runtime ready");
        Ok(Arc::new(runtime))
    }

    fn build(
        config: MutexConfig,
        resolved: Strategy,
        pool: deadpool_redis::Pool,
    ) -> Result<Self, MutexError> {
        let client = redis::Client::open(config.url.as_str())?;

        let strategy: Box<dyn LockStrategy> = match resolved {
            Strategy::Scripted => Box::new(ScriptedStrategy::new(pool)),
            Strategy::Transactional | Strategy::Auto => {
                Box::new(TransactionalStrategy::new(pool))
            }
        };

        let waiters = Arc::new(WaiterRegistry::new());
        let watcher = Watcher::new(client, Arc::clone(&waiters), config.reconnect_max);

        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            ns: config.ns,
            default_expire: config.expire,
            default_block: config.block,
            default_owner: config.owner,
            strategy_kind: resolved,
            strategy,
            waiters,
            watcher,
            auto_name: AtomicU64::new(0),
        })
    }

    /// Decide the strategy by evaluating a trivial script once.
    async fn probe_scripting(probe_pool: &deadpool_redis::Pool) -> Result<Strategy, MutexError> {
        let mut conn = pool::conn(probe_pool).await?;
        match redis::Script::new("return 1")
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            Ok(_) => Ok(Strategy::Scripted),
            Err(e) if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() => {
                Err(e.into())
            }
            Err(e) => {
                debug!(error = %e, "server-side scripting unavailable, using transactional strategy");
                Ok(Strategy::Transactional)
            }
        }
    }

    /// The strategy this runtime resolved at setup.
    pub fn strategy_kind(&self) -> Strategy {
        self.strategy_kind
    }

    /// Current state of the release-channel watcher.
    pub fn watcher_state(&self) -> WatcherState {
        self.watcher.state()
    }

    /// Stop the release-channel watcher.
    ///
    /// Refuses while tasks are still blocked in `lock` (stopping then would
    /// strand them) unless `force` is set, in which case the blocked tasks
    /// resume and surface a [`MutexError::Configuration`] instead.
    pub async fn stop_watcher(&self, force: bool) -> Result<(), MutexError> {
        let pending = self.waiters.handler_count();
        if pending > 0 && !force {
            return Err(MutexError::ActiveWaiters(pending));
        }
        self.watcher.stop().await;
        if force {
            self.waiters.wake_all();
        }
        Ok(())
    }

    /// Block until the watcher is subscribed, restarting it if it has died.
    pub(crate) async fn ensure_watching(&self) -> Result<(), MutexError> {
        self.watcher.wait_subscribed().await
    }

    pub(crate) fn strategy(&self) -> &dyn LockStrategy {
        self.strategy.as_ref()
    }

    pub(crate) fn waiters(&self) -> &Arc<WaiterRegistry> {
        &self.waiters
    }

    pub(crate) fn uuid(&self) -> &str {
        &self.uuid
    }

    pub(crate) fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub(crate) fn default_expire(&self) -> Duration {
        self.default_expire
    }

    pub(crate) fn default_block(&self) -> Option<Duration> {
        self.default_block
    }

    pub(crate) fn default_owner(&self) -> Option<&str> {
        self.default_owner.as_deref()
    }

    /// Generate a lock name for a mutex constructed without one.
    pub(crate) fn next_auto_name(&self) -> String {
        let n = self.auto_name.fetch_add(1, Ordering::Relaxed) + 1;
        format!("__@{n}.lock")
    }

    /// Build a runtime without touching the network; unit-test support for
    /// the pieces that never talk to the server.
    #[cfg(test)]
    pub(crate) fn detached(config: MutexConfig) -> Arc<Self> {
        let pool = pool::build(&config.url, config.pool_size).expect("detached pool");
        Arc::new(Self::build(config, Strategy::Transactional, pool).expect("detached runtime"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_fails_fast_when_server_unreachable() {
        let config = MutexConfig {
            url: "redis://127.0.0.1:1".into(),
            reconnect_max: Some(0),
            strategy: Strategy::Transactional,
            ..MutexConfig::default()
        };
        let err = MutexRuntime::setup(config).await.unwrap_err();
        assert!(matches!(err, MutexError::Watcher(_)));
    }

    #[tokio::test]
    async fn invalid_owner_token_is_rejected_at_setup() {
        let config = MutexConfig {
            owner: Some("bad token".into()),
            strategy: Strategy::Transactional,
            ..MutexConfig::default()
        };
        let err = MutexRuntime::setup(config).await.unwrap_err();
        assert!(matches!(err, MutexError::Configuration(_)));
    }

    #[tokio::test]
    async fn auto_names_are_unique() {
        let runtime = MutexRuntime::detached(MutexConfig::default());
        let a = runtime.next_auto_name();
        let b = runtime.next_auto_name();
        assert_ne!(a, b);
        assert!(a.starts_with("__@"));
        assert!(a.ends_with(".lock"));
    }

    #[tokio::test]
    async fn stop_watcher_without_waiters_succeeds() {
        let runtime = MutexRuntime::detached(MutexConfig::default());
        runtime.stop_watcher(false).await.expect("no waiters");
        assert_eq!(runtime.watcher_state(), WatcherState::Stopped);
    }
}
