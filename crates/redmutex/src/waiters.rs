//! Local waiter registry.
//!
//! Every task blocked in `lock()` registers one waiter under each of the
//! namespaced names it wants. The watcher wakes the *first* waiter per
//! released name, which caps the thundering herd at one re-attempt per
//! notification; losers simply re-queue on their next failed attempt because
//! registration outlives the whole call, not one attempt. Registration is
//! guarded: dropping the guard removes the entries on every exit path, so no
//! waiter can outlive the call that registered it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

/// A suspended caller's wakeup handle.
///
/// `signal` marks the waiter before waking it, so a notification delivered
/// between registration and suspension is never lost: the caller checks
/// `take_signal` before parking.
#[derive(Default)]
pub(crate) struct Waiter {
    signalled: AtomicBool,
    notify: Notify,
}

impl Waiter {
    pub(crate) fn signal(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume a pending signal, if any.
    pub(crate) fn take_signal(&self) -> bool {
        self.signalled.swap(false, Ordering::SeqCst)
    }

    /// Suspend until the next signal.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Runtime-wide map from namespaced lock name to its ordered waiter queue.
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    queues: DashMap<String, Vec<Arc<Waiter>>>,
}

impl WaiterRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register one waiter under every given name.
    pub(crate) fn register(self: &Arc<Self>, names: &[String]) -> WaiterGuard {
        let waiter = Arc::new(Waiter::default());
        for name in names {
            self.queues
                .entry(name.clone())
                .or_default()
                .push(Arc::clone(&waiter));
        }
        WaiterGuard {
            registry: Arc::clone(self),
            names: names.to_vec(),
            waiter,
        }
    }

    /// Total number of registered waiter entries across all names.
    pub(crate) fn handler_count(&self) -> usize {
        self.queues.iter().map(|queue| queue.value().len()).sum()
    }

    /// Wake every registered waiter (subscription replay and teardown).
    pub(crate) fn wake_all(&self) {
        let woken = self.collect_all();
        for waiter in woken {
            waiter.signal();
        }
    }

    /// Wake the first waiter of each released name, deduplicating a waiter
    /// registered under several of them.
    pub(crate) fn wake_released(&self, names: &[String]) {
        let mut woken: Vec<Arc<Waiter>> = Vec::new();
        for name in names {
            if let Some(queue) = self.queues.get(name) {
                if let Some(first) = queue.first() {
                    if !woken.iter().any(|w| Arc::ptr_eq(w, first)) {
                        woken.push(Arc::clone(first));
                    }
                }
            }
        }
        for waiter in woken {
            waiter.signal();
        }
    }

    fn collect_all(&self) -> Vec<Arc<Waiter>> {
        let mut all: Vec<Arc<Waiter>> = Vec::new();
        for queue in self.queues.iter() {
            for waiter in queue.value() {
                if !all.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                    all.push(Arc::clone(waiter));
                }
            }
        }
        all
    }
}

/// Removes the registration on drop.
pub(crate) struct WaiterGuard {
    registry: Arc<WaiterRegistry>,
    names: Vec<String>,
    waiter: Arc<Waiter>,
}

impl WaiterGuard {
    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        for name in &self.names {
            if let Some(mut queue) = self.registry.queues.get_mut(name) {
                queue.retain(|w| !Arc::ptr_eq(w, &self.waiter));
            }
            self.registry
                .queues
                .remove_if(name, |_, queue| queue.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn register_and_drop_cleans_up() {
        let registry = Arc::new(WaiterRegistry::new());
        let guard = registry.register(&names(&["a", "b"]));
        assert_eq!(registry.handler_count(), 2);
        drop(guard);
        assert_eq!(registry.handler_count(), 0);
        assert!(registry.queues.is_empty());
    }

    #[test]
    fn wake_released_signals_first_waiter_only() {
        let registry = Arc::new(WaiterRegistry::new());
        let first = registry.register(&names(&["a"]));
        let second = registry.register(&names(&["a"]));

        registry.wake_released(&names(&["a"]));
        assert!(first.waiter().take_signal());
        assert!(!second.waiter().take_signal());
    }

    #[test]
    fn wake_released_dedups_across_names() {
        let registry = Arc::new(WaiterRegistry::new());
        let guard = registry.register(&names(&["a", "b"]));

        registry.wake_released(&names(&["a", "b"]));
        assert!(guard.waiter().take_signal());
        // A single notification covering both names produces one signal.
        assert!(!guard.waiter().take_signal());
    }

    #[test]
    fn first_waiter_survives_until_its_own_exit() {
        let registry = Arc::new(WaiterRegistry::new());
        let first = registry.register(&names(&["a"]));
        let second = registry.register(&names(&["a"]));

        drop(first);
        registry.wake_released(&names(&["a"]));
        assert!(second.waiter().take_signal());
    }

    #[test]
    fn wake_all_reaches_every_waiter() {
        let registry = Arc::new(WaiterRegistry::new());
        let a = registry.register(&names(&["a"]));
        let b = registry.register(&names(&["a"]));
        let c = registry.register(&names(&["c"]));

        registry.wake_all();
        assert!(a.waiter().take_signal());
        assert!(b.waiter().take_signal());
        assert!(c.waiter().take_signal());
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let waiter = Waiter::default();
        waiter.signal();
        assert!(waiter.take_signal());
        // The stored notify permit also resolves a later wait immediately.
        waiter.signal();
        waiter.wait().await;
    }
}
