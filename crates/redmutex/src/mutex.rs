//! The public mutex object.
//!
//! A [`Mutex`] names one lock or an atomic set of locks and orchestrates the
//! backend strategy, the waiter registry and the watcher into the blocking
//! acquisition loop. Instances are cheap; share one across tasks (it takes
//! `&self` everywhere) or build one per call site.
//!
//! The held-state snapshot kept on the instance is a hint. [`Mutex::owned`]
//! is the authoritative check: the caller owns the lock iff its recorded
//! identity still matches the live store value for *every* name.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tracing::warn;

use crate::error::MutexError;
use crate::ident::{now_epoch, owner_ident, render_key, validate_owner_token};
use crate::runtime::MutexRuntime;
use crate::strategy::Attempt;
use crate::waiters::WaiterGuard;

/// Per-mutex overrides of the runtime defaults.
#[derive(Debug, Clone, Default)]
pub struct MutexOptions {
    /// Expiration timeout for locks taken by this mutex.
    pub expire: Option<Duration>,

    /// Wait timeout for `lock`; inherits the runtime default when unset.
    pub block: Option<Duration>,

    /// Namespace override for this mutex only.
    pub ns: Option<String>,

    /// Owner token, shared deliberately across tasks or mutex instances.
    /// Defaults to a random token per instance.
    pub owner: Option<String>,
}

impl MutexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }

    #[must_use]
    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Outcome of [`Mutex::refresh`].
///
/// Distinguishes "lost the lock to another owner" from "never held it";
/// both mean the caller does not own the lock now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Still the owner of every name; expiration was extended.
    Extended,
    /// Previously held, but the lock expired and was taken over.
    Lost,
    /// The mutex never held its lock.
    NeverHeld,
}

#[derive(Clone)]
struct Held {
    stored: String,
    expires_at: f64,
}

pub struct Mutex {
    runtime: Arc<MutexRuntime>,
    names: Vec<String>,
    keys: Vec<String>,
    ident: String,
    expire: Duration,
    block: Option<Duration>,
    held: StdMutex<Option<Held>>,
    sleep_signal: Notify,
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("names", &self.names)
            .field("keys", &self.keys)
            .field("ident", &self.ident)
            .field("expire", &self.expire)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl Mutex {
    /// Create a mutex over one or more lock names.
    ///
    /// An empty name list auto-generates a single name unique within the
    /// runtime. Multi-name mutexes lock and unlock all-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MutexError::Configuration`] for empty names or an invalid
    /// owner token.
    pub fn new<I, S>(
        runtime: &Arc<MutexRuntime>,
        names: I,
        options: MutexOptions,
    ) -> Result<Self, MutexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            names.push(runtime.next_auto_name());
        }
        if names.iter().any(String::is_empty) {
            return Err(MutexError::Configuration(
                "lock names must not be empty".into(),
            ));
        }

        let ns = options.ns.or_else(|| runtime.ns().map(ToString::to_string));
        let keys = names
            .iter()
            .map(|name| render_key(ns.as_deref(), name))
            .collect();

        let token = match options
            .owner
            .or_else(|| runtime.default_owner().map(ToString::to_string))
        {
            Some(token) => {
                validate_owner_token(&token)?;
                token
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        Ok(Self {
            ident: owner_ident(runtime.uuid(), &token),
            runtime: Arc::clone(runtime),
            names,
            keys,
            expire: options.expire.unwrap_or_else(|| runtime.default_expire()),
            block: options.block.or_else(|| runtime.default_block()),
            held: StdMutex::new(None),
            sleep_signal: Notify::new(),
        })
    }

    /// The lock names as given by the caller.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The namespaced store keys.
    pub fn namespaced_names(&self) -> &[String] {
        &self.keys
    }

    /// Attempt to take every name immediately; no waiting, no side effects
    /// on failure.
    ///
    /// Expired-but-present entries are not captured here; use [`Mutex::lock`]
    /// with a zero block timeout to reclaim an expired lock without waiting.
    pub async fn try_lock(&self) -> Result<bool, MutexError> {
        let expires_at = now_epoch() + self.expire.as_secs_f64();
        match self
            .runtime
            .strategy()
            .try_lock(&self.keys, &self.ident, expires_at)
            .await?
        {
            Some(stored) => {
                self.store_held(Held { stored, expires_at });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Acquire the lock, waiting until it is granted or `block` elapses.
    ///
    /// `block` overrides the configured block timeout for this call; the
    /// configured one applies when `None`. With no timeout at all this
    /// returns only after the lock has been granted. A zero timeout makes a
    /// single attempt but still reclaims expired holders.
    ///
    /// Returns `false` when the timeout elapsed without acquisition.
    ///
    /// # Errors
    ///
    /// [`MutexError::Deadlock`] when a current holder's identity equals this
    /// mutex's own; [`MutexError::Watcher`] when the notification channel
    /// cannot be established.
    pub async fn lock(&self, block: Option<Duration>) -> Result<bool, MutexError> {
        let block = block.or(self.block);
        let deadline = block.map(|b| tokio::time::Instant::now() + b);
        // Waiters register before the first attempt so a release published
        // between the attempt and the suspension is never missed; the guard
        // deregisters on every exit path.
        let guard = self.runtime.waiters().register(&self.keys);
        self.lock_loop(&guard, deadline).await
    }

    async fn lock_loop(
        &self,
        guard: &WaiterGuard,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<bool, MutexError> {
        loop {
            self.runtime.ensure_watching().await?;

            let expires_at = now_epoch() + self.expire.as_secs_f64();
            match self
                .runtime
                .strategy()
                .acquire(&self.keys, &self.ident, expires_at)
                .await?
            {
                Attempt::Acquired { stored } => {
                    self.store_held(Held { stored, expires_at });
                    return Ok(true);
                }
                Attempt::Deadlock => {
                    return Err(MutexError::Deadlock(self.ident.clone()));
                }
                Attempt::Busy { retry_at } => {
                    let holder_wait =
                        Duration::from_secs_f64((retry_at - now_epoch()).max(0.0));
                    let mut window = holder_wait;
                    if let Some(deadline) = deadline {
                        window = window
                            .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
                    }

                    if !guard.waiter().take_signal() && window > Duration::ZERO {
                        tokio::select! {
                            () = tokio::time::sleep(window) => {}
                            () = guard.waiter().wait() => {}
                        }
                    }

                    if guard.waiter().take_signal() {
                        continue;
                    }
                    if now_epoch() > retry_at {
                        // The conflicting holder has overrun its expiry; the
                        // next attempt reclaims it.
                        continue;
                    }
                    if let Some(deadline) = deadline {
                        if tokio::time::Instant::now() >= deadline {
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    /// Extend the expiration of a held lock.
    ///
    /// Tri-state result: [`RefreshOutcome::Extended`] when still owned,
    /// [`RefreshOutcome::Lost`] when the lock expired and another owner took
    /// over (the instance self-corrects to "not owned"), and
    /// [`RefreshOutcome::NeverHeld`] when this mutex holds nothing.
    pub async fn refresh(&self, expire: Option<Duration>) -> Result<RefreshOutcome, MutexError> {
        let Some(held) = self.held_snapshot() else {
            return Ok(RefreshOutcome::NeverHeld);
        };
        let expire = expire.unwrap_or(self.expire);
        let expires_at = now_epoch() + expire.as_secs_f64();
        match self
            .runtime
            .strategy()
            .refresh(&self.keys, &held.stored, &self.ident, expires_at)
            .await?
        {
            Some(stored) => {
                self.store_held(Held { stored, expires_at });
                Ok(RefreshOutcome::Extended)
            }
            None => {
                self.clear_held();
                Ok(RefreshOutcome::Lost)
            }
        }
    }

    /// Release the lock.
    ///
    /// Deletes every name iff all of them still carry this mutex's identity,
    /// then publishes a release notification. Returns `false` when the lock
    /// was not held, or had expired and been taken over.
    pub async fn unlock(&self) -> Result<bool, MutexError> {
        let Some(held) = self.take_held() else {
            return Ok(false);
        };
        self.runtime.strategy().unlock(&self.keys, &held.stored).await
    }

    /// Whether at least one name currently exists in the store, whoever
    /// owns it.
    pub async fn locked(&self) -> Result<bool, MutexError> {
        self.runtime.strategy().is_locked(&self.keys).await
    }

    /// Authoritative ownership check against the live store values.
    pub async fn owned(&self) -> Result<bool, MutexError> {
        let Some(held) = self.held_snapshot() else {
            return Ok(false);
        };
        let values = self.runtime.strategy().current_values(&self.keys).await?;
        Ok(values
            .iter()
            .all(|v| v.as_deref() == Some(held.stored.as_str())))
    }

    /// Whether the held lock has outlived its expiration.
    ///
    /// Instance-state hint only; `None` when nothing is held. Use
    /// [`Mutex::refresh`] or [`Mutex::owned`] for reliable information.
    pub fn expired(&self) -> Option<bool> {
        self.held_snapshot().map(|h| now_epoch() > h.expires_at)
    }

    /// Time left until the held lock expires; negative once overrun.
    /// Instance-state hint only; `None` when nothing is held.
    #[allow(clippy::cast_possible_truncation)]
    pub fn expires_in(&self) -> Option<TimeDelta> {
        self.held_snapshot()
            .map(|h| TimeDelta::microseconds(((h.expires_at - now_epoch()) * 1_000_000.0) as i64))
    }

    /// Instant at which the held lock expires. Instance-state hint only;
    /// `None` when nothing is held.
    #[allow(clippy::cast_possible_truncation)]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.held_snapshot()
            .and_then(|h| DateTime::from_timestamp_micros((h.expires_at * 1_000_000.0) as i64))
    }

    /// Run `work` with the lock held, releasing on every exit path.
    ///
    /// # Errors
    ///
    /// [`MutexError::Timeout`] when the block timeout elapses before
    /// acquisition; acquisition errors propagate unchanged.
    pub async fn synchronize<F, Fut, T>(&self, work: F) -> Result<T, MutexError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.lock(None).await? {
            return Err(MutexError::Timeout(self.block.unwrap_or_default()));
        }
        let result = work().await;
        if let Err(e) = self.unlock().await {
            // The critical section already ran; the entry expires on its own.
            warn!(error = %e, names = ?self.names, "failed to release lock after synchronize");
        }
        Ok(result)
    }

    /// Release the lock, suspend until `timeout` elapses or another task
    /// calls [`Mutex::wakeup`], then re-acquire.
    ///
    /// # Errors
    ///
    /// [`MutexError::Timeout`] when re-acquisition fails within the block
    /// timeout.
    pub async fn sleep(&self, timeout: Option<Duration>) -> Result<(), MutexError> {
        self.unlock().await?;
        match timeout {
            Some(timeout) => {
                tokio::select! {
                    () = self.sleep_signal.notified() => {}
                    () = tokio::time::sleep(timeout) => {}
                }
            }
            None => self.sleep_signal.notified().await,
        }
        if self.lock(None).await? {
            Ok(())
        } else {
            Err(MutexError::Timeout(self.block.unwrap_or_default()))
        }
    }

    /// Resume a task suspended in [`Mutex::sleep`] on this mutex.
    pub fn wakeup(&self) {
        self.sleep_signal.notify_one();
    }

    fn held_snapshot(&self) -> Option<Held> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_held(&self, held: Held) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = Some(held);
    }

    fn take_held(&self) -> Option<Held> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn clear_held(&self) {
        self.take_held();
    }
}
