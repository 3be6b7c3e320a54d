//! End-to-end scenarios against a live Redis server.
//!
//! Run with `cargo test --features integration`; the server defaults to
//! `redis://127.0.0.1:6379` and can be overridden via `REDIS_URL`. Every
//! runtime gets a disposable uuid namespace so concurrent runs do not
//! interfere.

#![cfg(feature = "integration")]

use std::sync::Arc;
use std::time::Duration;

use redmutex::{
    Mutex, MutexConfig, MutexError, MutexOptions, MutexRuntime, Namespace, Strategy, testing,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config(strategy: Strategy) -> MutexConfig {
    init_tracing();
    MutexConfig {
        url: std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        ns: Some(format!("redmutex-test-{}", uuid::Uuid::new_v4())),
        strategy,
        ..MutexConfig::default()
    }
}

async fn setup(strategy: Strategy) -> Arc<MutexRuntime> {
    MutexRuntime::setup(test_config(strategy))
        .await
        .expect("runtime setup should succeed")
}

fn opts() -> MutexOptions {
    MutexOptions::default().with_expire(Duration::from_secs(30))
}

#[tokio::test]
async fn conformance_transactional() {
    let runtime = setup(Strategy::Transactional).await;
    testing::run_mutex_conformance_tests(&runtime)
        .await
        .expect("conformance tests should pass");
}

#[tokio::test]
async fn conformance_scripted() {
    let runtime = setup(Strategy::Scripted).await;
    testing::run_mutex_conformance_tests(&runtime)
        .await
        .expect("conformance tests should pass");
}

#[tokio::test]
async fn auto_probe_prefers_scripts() {
    let runtime = setup(Strategy::Auto).await;
    assert_eq!(runtime.strategy_kind(), Strategy::Scripted);
}

#[tokio::test]
async fn blocked_lock_times_out() {
    let runtime = setup(Strategy::Auto).await;
    let holder = Mutex::new(&runtime, ["busy"], opts()).expect("mutex");
    assert!(holder.try_lock().await.expect("try_lock"));

    let contender = Mutex::new(&runtime, ["busy"], opts()).expect("mutex");
    let started = tokio::time::Instant::now();
    let acquired = contender
        .lock(Some(Duration::from_millis(300)))
        .await
        .expect("lock");
    assert!(!acquired, "lock should give up at the block timeout");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(280) && elapsed < Duration::from_secs(3),
        "timeout should be honored, elapsed {elapsed:?}"
    );

    holder.unlock().await.expect("unlock");
}

#[tokio::test]
async fn explicit_unlock_wakes_waiter_across_runtimes() {
    // Two runtimes sharing one namespace stand in for two processes: the
    // waiter can only learn of the release through the pub/sub channel.
    let config = test_config(Strategy::Auto);
    let runtime_a = MutexRuntime::setup(config.clone()).await.expect("runtime a");
    let runtime_b = MutexRuntime::setup(config).await.expect("runtime b");

    let holder = Mutex::new(&runtime_a, ["shared"], opts()).expect("mutex");
    assert!(holder.try_lock().await.expect("try_lock"));

    let waiter = tokio::spawn(async move {
        let mutex = Mutex::new(&runtime_b, ["shared"], opts()).expect("mutex");
        let started = tokio::time::Instant::now();
        let acquired = mutex
            .lock(Some(Duration::from_secs(10)))
            .await
            .expect("lock");
        (acquired, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(holder.unlock().await.expect("unlock"));

    let (acquired, waited) = waiter.await.expect("waiter task");
    assert!(acquired);
    assert!(
        waited < Duration::from_secs(2),
        "cross-process wakeup should ride the notification, waited {waited:?}"
    );
}

#[tokio::test]
async fn crashed_holder_is_reclaimed_at_expiry() {
    let config = test_config(Strategy::Auto);
    let runtime_a = MutexRuntime::setup(config.clone()).await.expect("runtime a");
    let runtime_b = MutexRuntime::setup(config).await.expect("runtime b");

    let crashed = Mutex::new(
        &runtime_a,
        ["fragile"],
        opts().with_expire(Duration::from_secs(2)),
    )
    .expect("mutex");
    assert!(crashed.try_lock().await.expect("try_lock"));
    // Never unlocked: runtime A's holder is presumed dead.

    let reclaimer = Mutex::new(&runtime_b, ["fragile"], opts()).expect("mutex");
    let started = tokio::time::Instant::now();
    let acquired = reclaimer
        .lock(Some(Duration::from_secs(10)))
        .await
        .expect("lock");
    let elapsed = started.elapsed();
    assert!(acquired, "expired lock must be reclaimable");
    assert!(
        elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_secs(6),
        "reclaim should track the 2s expiry, elapsed {elapsed:?}"
    );

    reclaimer.unlock().await.expect("unlock");
}

#[tokio::test]
async fn synchronized_counter_loses_no_updates() {
    let runtime = setup(Strategy::Auto).await;
    let counter = Arc::new(std::sync::Mutex::new(0_u32));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let runtime = Arc::clone(&runtime);
        let counter = Arc::clone(&counter);
        tasks.push(tokio::spawn(async move {
            let mutex = Mutex::new(&runtime, ["counter"], opts()).expect("mutex");
            for _ in 0..100 {
                mutex
                    .synchronize(|| async {
                        // Separate read and write with a yield in between;
                        // without the distributed lock this interleaving
                        // loses updates.
                        let seen = *counter.lock().expect("counter lock");
                        tokio::task::yield_now().await;
                        *counter.lock().expect("counter lock") = seen + 1;
                    })
                    .await
                    .expect("synchronize");
            }
        }));
    }
    for task in tasks {
        task.await.expect("counter task");
    }

    assert_eq!(*counter.lock().expect("counter lock"), 1000);
}

#[tokio::test]
async fn sleep_releases_and_wakeup_reacquires() {
    let runtime = setup(Strategy::Auto).await;
    let mutex = Arc::new(Mutex::new(&runtime, ["pillow"], opts()).expect("mutex"));
    assert!(mutex.try_lock().await.expect("try_lock"));

    let sleeper = {
        let mutex = Arc::clone(&mutex);
        tokio::spawn(async move { mutex.sleep(Some(Duration::from_secs(10))).await })
    };

    // The sleeper releases the lock while suspended.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let observer = Mutex::new(&runtime, ["pillow"], opts()).expect("mutex");
    assert!(
        !observer.locked().await.expect("locked"),
        "sleep should release the lock"
    );

    mutex.wakeup();
    sleeper
        .await
        .expect("sleeper task")
        .expect("sleep should re-acquire after wakeup");
    assert!(mutex.owned().await.expect("owned"), "lock re-acquired");

    mutex.unlock().await.expect("unlock");
}

#[tokio::test]
async fn synchronize_times_out_with_error() {
    let runtime = setup(Strategy::Auto).await;
    let holder = Mutex::new(&runtime, ["synchro"], opts()).expect("mutex");
    assert!(holder.try_lock().await.expect("try_lock"));

    let contender = Mutex::new(
        &runtime,
        ["synchro"],
        opts().with_block(Duration::from_millis(200)),
    )
    .expect("mutex");
    let err = contender
        .synchronize(|| async {})
        .await
        .expect_err("synchronize must raise when the block timeout passes");
    assert!(matches!(err, MutexError::Timeout(_)), "got {err:?}");

    holder.unlock().await.expect("unlock");
}

#[tokio::test]
async fn namespace_factory_round_trip() {
    let runtime = setup(Strategy::Auto).await;
    let ns = format!("group-{}", uuid::Uuid::new_v4());
    let group = Namespace::new(&runtime, &ns, opts());

    let value = group
        .synchronize(["task"], || async { 42 })
        .await
        .expect("synchronize");
    assert_eq!(value, 42);

    let held = group
        .lock(["task"])
        .await
        .expect("lock")
        .expect("uncontested namespaced lock should be granted");
    assert_eq!(held.namespaced_names(), [format!("{ns}:task")]);
    assert!(held.owned().await.expect("owned"));
    held.unlock().await.expect("unlock");
}

#[tokio::test]
async fn stop_watcher_refuses_then_forces() {
    let runtime = setup(Strategy::Auto).await;
    let holder = Mutex::new(&runtime, ["teardown"], opts()).expect("mutex");
    assert!(holder.try_lock().await.expect("try_lock"));

    let blocked = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let mutex = Mutex::new(&runtime, ["teardown"], opts()).expect("mutex");
            mutex.lock(Some(Duration::from_secs(30))).await
        })
    };
    // Give the contender time to register and park.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = runtime
        .stop_watcher(false)
        .await
        .expect_err("stop must refuse while a waiter is parked");
    assert!(matches!(err, MutexError::ActiveWaiters(1)), "got {err:?}");

    runtime.stop_watcher(true).await.expect("forced stop");
    let waiter_result = blocked.await.expect("blocked task");
    assert!(
        matches!(waiter_result, Err(MutexError::Configuration(_))),
        "forced teardown should surface an error to the waiter, got {waiter_result:?}"
    );

    holder.unlock().await.expect("unlock");
}
