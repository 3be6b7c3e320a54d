//! Release-notification watcher.
//!
//! One long-lived subscription per runtime to the shared release channel.
//! Inbound messages carry the namespaced names just released; for each the
//! watcher wakes only the first locally registered waiter. On every
//! successful (re)subscription it wakes all waiters, covering notifications
//! that may have been missed while connecting. Connection errors are retried
//! with a short, escalating backoff up to `reconnect_max` attempts; past the
//! bound the watcher is `Failed` and blocked lock calls surface the error
//! instead of silently degrading to timer polling.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::MutexError;
use crate::waiters::WaiterRegistry;

/// Well-known channel carrying release notifications, shared by every
/// process regardless of namespace.
pub(crate) const SIGNAL_CHANNEL: &str = "redmutex:release";

/// Backoff before the first reconnection attempt.
const RECONNECT_DELAY_FIRST: Duration = Duration::from_millis(100);

/// Backoff once reconnection has failed repeatedly.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of the release-channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No subscription and no task trying to establish one.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Subscribed; waiters wake on notifications.
    Subscribed,
    /// Subscription lost; backing off before the next attempt.
    Reconnecting,
    /// Explicitly stopped. Terminal.
    Stopped,
    /// Reconnect bound exceeded. Lock operations fail until restarted.
    Failed,
}

pub(crate) struct Watcher {
    shared: Arc<Shared>,
}

struct Shared {
    client: redis::Client,
    waiters: Arc<WaiterRegistry>,
    reconnect_max: Option<u32>,
    state_tx: watch::Sender<WatcherState>,
    task: StdMutex<TaskSlot>,
}

#[derive(Default)]
struct TaskSlot {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn new(
        client: redis::Client,
        waiters: Arc<WaiterRegistry>,
        reconnect_max: Option<u32>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                client,
                waiters,
                reconnect_max,
                state_tx,
                task: StdMutex::new(TaskSlot::default()),
            }),
        }
    }

    pub(crate) fn state(&self) -> WatcherState {
        *self.shared.state_tx.borrow()
    }

    /// Spawn the subscriber task unless a live one is already connecting,
    /// subscribed or backing off.
    pub(crate) fn start(&self) {
        let mut slot = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = *self.shared.state_tx.borrow();
        let task_alive = slot.handle.as_ref().is_some_and(|h| !h.is_finished());
        if task_alive
            && matches!(
                state,
                WatcherState::Connecting | WatcherState::Subscribed | WatcherState::Reconnecting
            )
        {
            return;
        }
        // A task observed in `Failed` is past its last state write; cancel
        // its token and take over.
        slot.token.cancel();
        let token = CancellationToken::new();
        self.shared.set_state(WatcherState::Connecting);
        slot.handle = Some(tokio::spawn(Shared::run(
            Arc::clone(&self.shared),
            token.clone(),
        )));
        slot.token = token;
    }

    /// Stop the subscriber task and wait for it to exit.
    pub(crate) async fn stop(&self) {
        let (token, handle) = {
            let mut slot = self
                .shared
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (slot.token.clone(), slot.handle.take())
        };
        token.cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.set_state(WatcherState::Stopped);
    }

    /// Wait until the watcher is subscribed, restarting it once if it has
    /// already failed. Errors if the channel cannot be established or the
    /// watcher was explicitly stopped.
    pub(crate) async fn wait_subscribed(&self) -> Result<(), MutexError> {
        let mut rx = self.shared.state_tx.subscribe();
        let mut restarted = false;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                WatcherState::Subscribed => return Ok(()),
                WatcherState::Stopped => {
                    return Err(MutexError::Configuration(
                        "watcher has been stopped".into(),
                    ));
                }
                WatcherState::Failed => {
                    if restarted {
                        return Err(MutexError::Watcher(
                            "release channel could not be established".into(),
                        ));
                    }
                    restarted = true;
                    self.start();
                    continue;
                }
                WatcherState::Disconnected => self.start(),
                WatcherState::Connecting | WatcherState::Reconnecting => {}
            }
            rx.changed()
                .await
                .map_err(|_| MutexError::Watcher("watcher state channel closed".into()))?;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let slot = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.token.cancel();
    }
}

impl Shared {
    fn set_state(&self, state: WatcherState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(?prev, ?state, "watcher state changed");
        }
    }

    async fn run(shared: Arc<Self>, token: CancellationToken) {
        let mut retries: u32 = 0;
        loop {
            if token.is_cancelled() {
                shared.set_state(WatcherState::Stopped);
                return;
            }

            let subscription = async {
                let mut pubsub = shared.client.get_async_pubsub().await?;
                pubsub.subscribe(SIGNAL_CHANNEL).await?;
                Ok::<_, redis::RedisError>(pubsub)
            }
            .await;

            match subscription {
                Ok(mut pubsub) => {
                    retries = 0;
                    shared.set_state(WatcherState::Subscribed);
                    debug!(channel = SIGNAL_CHANNEL, "subscribed to release channel");
                    // Replay a full wake: notifications published while we
                    // were connecting are gone for good.
                    shared.waiters.wake_all();

                    let mut stream = pubsub.on_message();
                    loop {
                        tokio::select! {
                            () = token.cancelled() => {
                                shared.set_state(WatcherState::Stopped);
                                return;
                            }
                            msg = stream.next() => {
                                match msg {
                                    Some(msg) => shared.dispatch(&msg),
                                    None => {
                                        warn!("release channel connection lost");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to release channel");
                }
            }

            retries += 1;
            if let Some(max) = shared.reconnect_max {
                if retries > max {
                    error!(retries, "watcher exceeded reconnect limit, giving up");
                    shared.set_state(WatcherState::Failed);
                    // Resume blocked lock calls so they surface the failure.
                    shared.waiters.wake_all();
                    return;
                }
            }
            shared.set_state(WatcherState::Reconnecting);
            tokio::select! {
                () = token.cancelled() => {
                    shared.set_state(WatcherState::Stopped);
                    return;
                }
                () = tokio::time::sleep(backoff_delay(retries)) => {}
            }
        }
    }

    fn dispatch(&self, msg: &redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "undecodable release notification");
                return;
            }
        };
        match serde_json::from_str::<Vec<String>>(&payload) {
            Ok(names) => {
                debug!(?names, "release notification");
                self.waiters.wake_released(&names);
            }
            Err(e) => {
                warn!(error = %e, "malformed release notification payload");
            }
        }
    }
}

/// Short delay for the first retry, escalating once failures repeat.
fn backoff_delay(retries: u32) -> Duration {
    if retries > 1 {
        RECONNECT_DELAY
    } else {
        RECONNECT_DELAY_FIRST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_after_first_retry() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_secs(1));
        assert_eq!(backoff_delay(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn starts_in_disconnected_state() {
        let client = redis::Client::open("redis://127.0.0.1:1").expect("client url");
        let watcher = Watcher::new(client, Arc::new(WaiterRegistry::new()), Some(0));
        assert_eq!(watcher.state(), WatcherState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_server_fails_within_bound() {
        let client = redis::Client::open("redis://127.0.0.1:1").expect("client url");
        let waiters = Arc::new(WaiterRegistry::new());
        let watcher = Watcher::new(client, Arc::clone(&waiters), Some(0));
        let err = watcher.wait_subscribed().await.unwrap_err();
        assert!(matches!(err, MutexError::Watcher(_)));
        assert_eq!(watcher.state(), WatcherState::Failed);
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let client = redis::Client::open("redis://127.0.0.1:1").expect("client url");
        let watcher = Watcher::new(client, Arc::new(WaiterRegistry::new()), Some(0));
        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
        let err = watcher.wait_subscribed().await.unwrap_err();
        assert!(matches!(err, MutexError::Configuration(_)));
    }
}
