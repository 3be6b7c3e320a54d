//! Namespace-bound mutex factory.
//!
//! A [`Namespace`] partitions lock names into an independent group and
//! carries default options for every mutex built through it, so call sites
//! stay free of repeated configuration. It consumes only the public mutex
//! contract.

use std::future::Future;
use std::sync::Arc;

use crate::error::MutexError;
use crate::mutex::{Mutex, MutexOptions};
use crate::runtime::MutexRuntime;

pub struct Namespace {
    runtime: Arc<MutexRuntime>,
    ns: String,
    defaults: MutexOptions,
}

impl Namespace {
    /// Create a factory producing mutexes under `ns` with the given default
    /// options. The namespace always wins over `defaults.ns`.
    pub fn new(
        runtime: &Arc<MutexRuntime>,
        ns: impl Into<String>,
        defaults: MutexOptions,
    ) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            ns: ns.into(),
            defaults,
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Build a namespaced mutex with this factory's default options.
    pub fn mutex<I, S>(&self, names: I) -> Result<Mutex, MutexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutex_with(names, MutexOptions::default())
    }

    /// Build a namespaced mutex; per-call options override the factory
    /// defaults, except the namespace itself.
    pub fn mutex_with<I, S>(&self, names: I, options: MutexOptions) -> Result<Mutex, MutexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let merged = MutexOptions {
            expire: options.expire.or(self.defaults.expire),
            block: options.block.or(self.defaults.block),
            ns: Some(self.ns.clone()),
            owner: options.owner.or_else(|| self.defaults.owner.clone()),
        };
        Mutex::new(&self.runtime, names, merged)
    }

    /// Grab the lock, waiting if needed. Returns the held mutex on success,
    /// `None` when the block timeout elapsed.
    pub async fn lock<I, S>(&self, names: I) -> Result<Option<Mutex>, MutexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mutex = self.mutex(names)?;
        Ok(mutex.lock(None).await?.then_some(mutex))
    }

    /// Run `work` under a namespaced lock; see [`Mutex::synchronize`].
    pub async fn synchronize<I, S, F, Fut, T>(&self, names: I, work: F) -> Result<T, MutexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.mutex(names)?.synchronize(work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MutexConfig;

    #[tokio::test]
    async fn factory_namespaces_every_mutex() {
        let runtime = MutexRuntime::detached(MutexConfig::default());
        let ns = Namespace::new(&runtime, "reports", MutexOptions::default());
        let mutex = ns.mutex(["daily"]).expect("mutex");
        assert_eq!(mutex.namespaced_names(), ["reports:daily"]);
    }

    #[tokio::test]
    async fn namespace_wins_over_option_ns() {
        let runtime = MutexRuntime::detached(MutexConfig::default());
        let ns = Namespace::new(&runtime, "reports", MutexOptions::default());
        let mutex = ns
            .mutex_with(["daily"], MutexOptions::default().with_ns("other"))
            .expect("mutex");
        assert_eq!(mutex.namespaced_names(), ["reports:daily"]);
    }
}
