//! Optimistic transaction strategy.
//!
//! Portable to any server with `WATCH`/`MULTI`: conflicts abort the `EXEC`
//! and the operation retries against a fresh snapshot. Expiration instants
//! travel inside the stored values, so crash recovery is cooperative: the
//! next contender that notices an overrun deletes the stale entries and
//! publishes their names as if they had been unlocked.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::MutexError;
use crate::ident::{decode_value, encode_value, now_epoch};
use crate::pool;
use crate::strategy::{Attempt, LockStrategy};
use crate::watcher::SIGNAL_CHANNEL;

pub(crate) struct TransactionalStrategy {
    pool: Pool,
}

impl TransactionalStrategy {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Watch the keys and read their values in one consistent snapshot.
    async fn watched_values(
        conn: &mut deadpool_redis::Connection,
        keys: &[String],
    ) -> Result<Vec<Option<String>>, MutexError> {
        redis::cmd("WATCH")
            .arg(keys)
            .query_async::<()>(conn)
            .await?;
        match redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(conn)
            .await
        {
            Ok(values) => Ok(values),
            Err(e) => {
                Self::unwatch(conn).await;
                Err(e.into())
            }
        }
    }

    /// Drop the watch so the pooled connection is returned clean.
    async fn unwatch(conn: &mut deadpool_redis::Connection) {
        let _ = redis::cmd("UNWATCH").query_async::<()>(conn).await;
    }

    fn payload(names: &[String]) -> Result<String, MutexError> {
        serde_json::to_string(names).map_err(|e| MutexError::Backend(e.to_string()))
    }
}

#[async_trait]
impl LockStrategy for TransactionalStrategy {
    async fn try_lock(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError> {
        let stored = encode_value(ident, expires_at);
        let mut conn = pool::conn(&self.pool).await?;
        let set: bool = if let [key] = keys {
            conn.set_nx(key, &stored).await?
        } else {
            let pairs: Vec<(&str, &str)> =
                keys.iter().map(|k| (k.as_str(), stored.as_str())).collect();
            conn.mset_nx(&pairs).await?
        };
        Ok(set.then_some(stored))
    }

    async fn acquire(
        &self,
        keys: &[String],
        ident: &str,
        expires_at: f64,
    ) -> Result<Attempt, MutexError> {
        if let Some(stored) = self.try_lock(keys, ident, expires_at).await? {
            return Ok(Attempt::Acquired { stored });
        }

        let now = now_epoch();
        let mut conn = pool::conn(&self.pool).await?;
        let values = Self::watched_values(&mut conn, keys).await?;

        let mut nearest: Option<f64> = None;
        let mut expired: Vec<String> = Vec::new();
        for (key, value) in keys.iter().zip(&values) {
            let Some(raw) = value else { continue };
            let (owner, holder_expires_at) = decode_value(raw);
            // Recursive acquisition is checked before any expiry handling so
            // a caller can never silently re-enter its own lock.
            if owner == ident {
                Self::unwatch(&mut conn).await;
                return Ok(Attempt::Deadlock);
            }
            if nearest.is_none_or(|n| holder_expires_at < n) {
                nearest = Some(holder_expires_at);
            }
            if holder_expires_at < now {
                expired.push(key.clone());
            }
        }

        // A key that vanished between the failed try and the snapshot means
        // the holder just released; retry immediately.
        let retry_at = nearest.unwrap_or(now);

        if expired.is_empty() {
            Self::unwatch(&mut conn).await;
        } else {
            // Crash recovery: delete the overrun entries and notify waiters
            // as if they had been unlocked. An aborted EXEC means another
            // contender got there first, which serves the same purpose.
            let payload = Self::payload(&expired)?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(&expired)
                .cmd("PUBLISH")
                .arg(SIGNAL_CHANNEL)
                .arg(&payload);
            let exec: Option<redis::Value> = pipe.query_async(&mut conn).await?;
            if exec.is_some() {
                debug!(names = ?expired, "reclaimed expired lock entries");
            }
        }

        Ok(Attempt::Busy { retry_at })
    }

    async fn refresh(
        &self,
        keys: &[String],
        stored: &str,
        ident: &str,
        expires_at: f64,
    ) -> Result<Option<String>, MutexError> {
        let new_stored = encode_value(ident, expires_at);
        let mut conn = pool::conn(&self.pool).await?;
        loop {
            let values = Self::watched_values(&mut conn, keys).await?;
            let held: Vec<String> = keys
                .iter()
                .zip(&values)
                .filter(|(_, v)| v.as_deref() == Some(stored))
                .map(|(k, _)| k.clone())
                .collect();

            if held.len() == keys.len() {
                let mut pipe = redis::pipe();
                pipe.atomic().cmd("MSET");
                for key in keys {
                    pipe.arg(key).arg(&new_stored);
                }
                let exec: Option<redis::Value> = pipe.query_async(&mut conn).await?;
                if exec.is_some() {
                    return Ok(Some(new_stored));
                }
            } else if held.is_empty() {
                Self::unwatch(&mut conn).await;
                return Ok(None);
            } else {
                // Partial ownership is not a valid state: clear what is left
                // and report the lock as lost.
                let payload = Self::payload(&held)?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("DEL")
                    .arg(&held)
                    .cmd("PUBLISH")
                    .arg(SIGNAL_CHANNEL)
                    .arg(&payload);
                let exec: Option<redis::Value> = pipe.query_async(&mut conn).await?;
                if exec.is_some() {
                    debug!(names = ?held, "cleared partially owned lock entries");
                    return Ok(None);
                }
            }
            // EXEC aborted: another writer touched the keys; retry against a
            // fresh snapshot.
        }
    }

    async fn unlock(&self, keys: &[String], stored: &str) -> Result<bool, MutexError> {
        let payload = Self::payload(keys)?;
        let mut conn = pool::conn(&self.pool).await?;
        loop {
            let values = Self::watched_values(&mut conn, keys).await?;
            if !values.iter().all(|v| v.as_deref() == Some(stored)) {
                Self::unwatch(&mut conn).await;
                return Ok(false);
            }
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(keys)
                .cmd("PUBLISH")
                .arg(SIGNAL_CHANNEL)
                .arg(&payload);
            let exec: Option<redis::Value> = pipe.query_async(&mut conn).await?;
            if exec.is_some() {
                return Ok(true);
            }
        }
    }

    async fn is_locked(&self, keys: &[String]) -> Result<bool, MutexError> {
        let mut conn = pool::conn(&self.pool).await?;
        let existing: i64 = redis::cmd("EXISTS")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(existing > 0)
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
