//! Conformance test suite for the locking contract.
//!
//! Call [`run_mutex_conformance_tests`] from an integration test with a
//! runtime connected to a disposable namespace; the suite exercises the
//! contract both strategies must satisfy identically.

use std::sync::Arc;
use std::time::Duration;

use crate::error::MutexError;
use crate::mutex::{Mutex, MutexOptions, RefreshOutcome};
use crate::runtime::MutexRuntime;

fn opts() -> MutexOptions {
    // Short enough that leaked keys vanish quickly from a shared test server.
    MutexOptions::default().with_expire(Duration::from_secs(30))
}

/// Run the full mutex conformance suite.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_mutex_conformance_tests(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    test_try_lock_and_unlock(runtime).await?;
    test_try_lock_contention(runtime).await?;
    test_mutual_exclusion_race(runtime).await?;
    test_multi_key_all_or_nothing(runtime).await?;
    test_deadlock_detection(runtime).await?;
    test_refresh_tristate(runtime).await?;
    test_locked_and_owned_views(runtime).await?;
    test_unlock_wakes_waiter(runtime).await?;
    test_expired_holder_is_reclaimed(runtime).await?;
    Ok(())
}

async fn test_try_lock_and_unlock(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let mutex = Mutex::new(runtime, ["conf-basic"], opts())?;
    assert!(mutex.try_lock().await?, "uncontested try_lock should succeed");
    assert!(mutex.locked().await?, "locked should see the held entry");
    assert!(mutex.owned().await?, "owned should confirm our identity");
    assert!(mutex.unlock().await?, "unlock should delete our entry");
    assert!(!mutex.locked().await?, "nothing should remain after unlock");
    Ok(())
}

async fn test_try_lock_contention(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let holder = Mutex::new(runtime, ["conf-contention"], opts())?;
    assert!(holder.try_lock().await?);

    let contender = Mutex::new(runtime, ["conf-contention"], opts())?;
    assert!(
        !contender.try_lock().await?,
        "second try_lock should fail while held"
    );
    assert!(
        !contender.owned().await?,
        "contender must not believe it owns the lock"
    );

    holder.unlock().await?;
    Ok(())
}

async fn test_mutual_exclusion_race(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let runtime = Arc::clone(runtime);
        tasks.push(tokio::spawn(async move {
            let mutex = Mutex::new(&runtime, ["conf-race"], opts())?;
            mutex.try_lock().await
        }));
    }
    let mut granted = 0;
    for task in tasks {
        if task.await.expect("race task should not panic")? {
            granted += 1;
        }
    }
    assert_eq!(granted, 1, "exactly one of the racing tasks may win");
    Ok(())
}

async fn test_multi_key_all_or_nothing(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let holder = Mutex::new(runtime, ["conf-multi-a"], opts())?;
    assert!(holder.try_lock().await?);

    let contender = Mutex::new(runtime, ["conf-multi-a", "conf-multi-b"], opts())?;
    assert!(
        !contender.try_lock().await?,
        "partially conflicting multi-key try_lock should fail"
    );

    let free = Mutex::new(runtime, ["conf-multi-b"], opts())?;
    assert!(
        !free.locked().await?,
        "failed multi-key attempt must not leave any name set"
    );

    holder.unlock().await?;
    Ok(())
}

async fn test_deadlock_detection(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let mutex = Mutex::new(runtime, ["conf-deadlock"], opts())?;
    assert!(mutex.lock(Some(Duration::from_secs(1))).await?);

    let err = mutex
        .lock(Some(Duration::from_secs(1)))
        .await
        .expect_err("re-acquiring an owned lock must fail immediately");
    assert!(
        matches!(err, MutexError::Deadlock(_)),
        "expected a deadlock error, got {err:?}"
    );

    // A different instance sharing the owner token trips the same check.
    let shared = opts().with_owner("conf-deadlock-owner");
    let first = Mutex::new(runtime, ["conf-deadlock-shared"], shared.clone())?;
    assert!(first.try_lock().await?);
    let second = Mutex::new(runtime, ["conf-deadlock-shared"], shared)?;
    let err = second
        .lock(Some(Duration::from_secs(1)))
        .await
        .expect_err("shared-owner re-acquisition must fail");
    assert!(matches!(err, MutexError::Deadlock(_)));

    mutex.unlock().await?;
    first.unlock().await?;
    Ok(())
}

async fn test_refresh_tristate(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let mutex = Mutex::new(runtime, ["conf-refresh"], opts())?;
    assert_eq!(
        mutex.refresh(None).await?,
        RefreshOutcome::NeverHeld,
        "refresh without a prior lock must report never-held"
    );

    assert!(mutex.try_lock().await?);
    assert_eq!(
        mutex.refresh(Some(Duration::from_secs(60))).await?,
        RefreshOutcome::Extended,
        "refresh while owned must extend"
    );
    assert!(mutex.owned().await?);
    mutex.unlock().await?;

    // Lose the lock: take it with a tiny TTL, let it lapse, have another
    // owner reclaim it, then refresh the stale instance.
    let loser = Mutex::new(
        runtime,
        ["conf-refresh-lost"],
        opts().with_expire(Duration::from_millis(200)),
    )?;
    assert!(loser.try_lock().await?);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let taker = Mutex::new(runtime, ["conf-refresh-lost"], opts())?;
    assert!(
        taker.lock(Some(Duration::from_secs(2))).await?,
        "expired lock should be reclaimable"
    );

    assert_eq!(
        loser.refresh(None).await?,
        RefreshOutcome::Lost,
        "refresh after takeover must report the lock as lost"
    );
    assert!(!loser.owned().await?, "lost lock must self-correct");

    taker.unlock().await?;
    Ok(())
}

async fn test_locked_and_owned_views(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let holder = Mutex::new(runtime, ["conf-views"], opts())?;
    assert!(holder.try_lock().await?);

    let observer = Mutex::new(runtime, ["conf-views"], opts())?;
    assert!(observer.locked().await?, "locked is owner-agnostic");
    assert!(!observer.owned().await?, "owned is identity-specific");

    holder.unlock().await?;
    Ok(())
}

async fn test_unlock_wakes_waiter(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let holder = Mutex::new(runtime, ["conf-wakeup"], opts())?;
    assert!(holder.try_lock().await?);

    let waiter_runtime = Arc::clone(runtime);
    let waiter = tokio::spawn(async move {
        let mutex = Mutex::new(&waiter_runtime, ["conf-wakeup"], opts())?;
        let started = tokio::time::Instant::now();
        let acquired = mutex.lock(Some(Duration::from_secs(10))).await?;
        if acquired {
            mutex.unlock().await?;
        }
        Ok::<_, MutexError>((acquired, started.elapsed()))
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(holder.unlock().await?);

    let (acquired, waited) = waiter.await.expect("waiter task should not panic")?;
    assert!(acquired, "waiter should acquire after the explicit unlock");
    assert!(
        waited < Duration::from_secs(5),
        "waiter must wake on the release notification, far before the \
         30s holder TTL (waited {waited:?})"
    );
    Ok(())
}

async fn test_expired_holder_is_reclaimed(runtime: &Arc<MutexRuntime>) -> Result<(), MutexError> {
    let crashed = Mutex::new(
        runtime,
        ["conf-expiry"],
        opts().with_expire(Duration::from_millis(300)),
    )?;
    assert!(crashed.try_lock().await?);
    // No unlock: simulate a holder that died.

    let reclaimer = Mutex::new(runtime, ["conf-expiry"], opts())?;
    let started = tokio::time::Instant::now();
    assert!(
        reclaimer.lock(Some(Duration::from_secs(5))).await?,
        "abandoned lock should be reclaimable after its TTL"
    );
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "reclaim should happen at expiry, not at the block timeout"
    );

    reclaimer.unlock().await?;
    Ok(())
}
