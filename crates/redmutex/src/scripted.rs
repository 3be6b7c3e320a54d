//! Server-side script strategy.
//!
//! Every attempt is one atomic round trip, immune to the partial-failure
//! races the transactional strategy has to retry around. Scripts are invoked
//! by digest; on a `NOSCRIPT` response the source is loaded and the call
//! retried once, transparently to the caller. Expiration is the native
//! per-key TTL, so abandoned locks disappear on their own and reclaiming
//! them needs no extra bookkeeping.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::error::MutexError;
use crate::ident::now_epoch;
use crate::pool;
use crate::scripts;
use crate::strategy::{Attempt, LockStrategy};
use crate::watcher::SIGNAL_CHANNEL;

/// Fallback retry interval when a conflicting key reports no TTL (a holder
/// written by something other than this crate).
const NO_TTL_RETRY: Duration = Duration::from_millis(50);

pub(crate) struct ScriptedStrategy {
    pool: Pool,
    try_lock_single: Script,
    try_lock_multi: Script,
    lock_single: Script,
    lock_multi: Script,
    unlock: Script,
    refresh: Script,
    is_locked: Script,
}

impl ScriptedStrategy {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            pool,
            try_lock_single: Script::new(scripts::TRY_LOCK_SINGLE),
            try_lock_multi: Script::new(scripts::TRY_LOCK_MULTI),
            lock_single: Script::new(scripts::LOCK_SINGLE),
            lock_multi: Script::new(scripts::LOCK_MULTI),
            unlock: Script::new(scripts::UNLOCK),
            refresh: Script::new(scripts::REFRESH),
            is_locked: Script::new(scripts::IS_LOCKED),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn epoch_ms(expires_at: f64) -> i64 {
        (expires_at * 1000.0) as i64
    }
}

#[async_trait]
impl LockStrategy for ScriptedStrategy {
    async fn try_lock(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError> {
        let script = if keys.len() == 1 {
            &self.try_lock_single
        } else {
            &self.try_lock_multi
        };
        let mut conn = pool::conn(&self.pool).await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(ident).arg(Self::epoch_ms(expires_at));
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok((result == 1).then(|| ident.to_string()))
    }

    #[allow(clippy::cast_precision_loss)]
    async fn acquire(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Attempt, MutexError> {
        let script = if keys.len() == 1 {
            &self.lock_single
        } else {
            &self.lock_multi
        };
        let mut conn = pool::conn(&self.pool).await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(ident).arg(Self::epoch_ms(expires_at));
        let result: redis::Value = invocation.invoke_async(&mut conn).await?;

        match result {
            redis::Value::Okay => Ok(Attempt::Acquired {
                stored: ident.to_string(),
            }),
            redis::Value::BulkString(ref b) if b == b"OK" => Ok(Attempt::Acquired {
                stored: ident.to_string(),
            }),
            redis::Value::BulkString(ref b) if b == b"DD" => Ok(Attempt::Deadlock),
            redis::Value::Int(ttl_ms) => {
                let retry_at = if ttl_ms >= 0 {
                    now_epoch() + ttl_ms as f64 / 1000.0
                } else {
                    debug!(?keys, "conflicting holder has no TTL, using fallback interval");
                    now_epoch() + NO_TTL_RETRY.as_secs_f64()
                };
                Ok(Attempt::Busy { retry_at })
            }
            other => Err(MutexError::Backend(format!(
                "unexpected lock script response: {other:?}"
            ))),
        }
    }

    async fn refresh(
        &self,
        keys: &[String],
        stored: &str,
        _ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError> {
        let mut conn = pool::conn(&self.pool).await?;
        let mut invocation = self.refresh.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(stored).arg(Self::epoch_ms(expires_at));
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok((result == 1).then(|| stored.to_string()))
    }

    async fn unlock(&self, keys: &[String], stored: &str) -> Result<bool, MutexError> {
        let mut conn = pool::conn(&self.pool).await?;
        let mut invocation = self.unlock.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        invocation.arg(stored);
        let removed: usize = invocation.invoke_async(&mut conn).await?;
        if removed > 0 {
            let payload =
                serde_json::to_string(keys).map_err(|e| MutexError::Backend(e.to_string()))?;
            let _: i64 = conn.publish(SIGNAL_CHANNEL, payload).await?;
        }
        Ok(removed == keys.len())
    }

    async fn is_locked(&self, keys: &[String]) -> Result<bool, MutexError> {
        let mut conn = pool::conn(&self.pool).await?;
        let mut invocation = self.is_locked.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        let result: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(result == 1)
    }

    async fn current_values(&self, keys: &[String]) -> Result<Vec<Option<String>>, MutexError> {
        let mut conn = pool::conn(&self.pool).await?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }
}
