// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of the session manager over the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use workflow_session::{
    CreateResult, FallbackLocker, FallbackMappingStore, InMemoryLocker, InMemoryMappingStore,
    LockError, LockHandle, Locker, Manager, ManagerConfig, MappingStore, SessionError,
    StoreError,
};

struct UnreachableStore;

#[async_trait]
impl MappingStore for UnreachableStore {
    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(3)))
    }

    async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(3)))
    }

    async fn touch(&self, _: &str, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(3)))
    }
}

struct UnreachableLocker;

#[async_trait]
impl Locker for UnreachableLocker {
    async fn try_lock(
        &self,
        _: &str,
        _: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        Err(LockError::Timeout(Duration::from_secs(3)))
    }
}

fn memory_manager(config: ManagerConfig) -> Manager {
    Manager::new(
        config,
        Arc::new(InMemoryMappingStore::new()),
        Arc::new(InMemoryLocker::new()),
    )
}

fn fast_config() -> ManagerConfig {
    ManagerConfig::builder()
        .lock_wait_timeout(Duration::from_secs(5))
        .lock_retry_interval(Duration::from_millis(10))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_session() {
    let manager = memory_manager(fast_config());
    let created = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        let created = created.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            manager
                .get_or_create("wf-shared", &cancel, move |_| async move {
                    let n = created.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(CreateResult::new(format!("sess-{n}"), "first answer"))
                })
                .await
        }));
    }

    let mut session_ids = Vec::new();
    let mut creators = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        if outcome.was_created() {
            creators += 1;
        }
        session_ids.push(outcome.session_id().to_string());
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(creators, 1);
    assert!(session_ids.iter().all(|id| id == "sess-0"));
}

#[tokio::test]
async fn independent_workflow_runs_get_independent_sessions() {
    let manager = memory_manager(fast_config());
    let cancel = CancellationToken::new();

    let a = manager
        .get_or_create("wf-a", &cancel, |_| async { Ok(CreateResult::new("sess-a", "")) })
        .await
        .unwrap();
    let b = manager
        .get_or_create("wf-b", &cancel, |_| async { Ok(CreateResult::new("sess-b", "")) })
        .await
        .unwrap();

    assert!(a.was_created() && b.was_created());
    assert_eq!(manager.get("wf-a", &cancel).await.unwrap().as_deref(), Some("sess-a"));
    assert_eq!(manager.get("wf-b", &cancel).await.unwrap().as_deref(), Some("sess-b"));
}

#[tokio::test]
async fn creator_payload_only_returned_to_creator() {
    let manager = memory_manager(fast_config());
    let cancel = CancellationToken::new();

    let first = manager
        .get_or_create("wf-payload", &cancel, |_| async {
            Ok(CreateResult::new("sess-A", "hello"))
        })
        .await
        .unwrap();
    let second = manager
        .get_or_create("wf-payload", &cancel, |_| async {
            Ok(CreateResult::new("sess-B", "never"))
        })
        .await
        .unwrap();

    assert_eq!(
        first,
        workflow_session::SessionOutcome::Created(CreateResult::new("sess-A", "hello"))
    );
    assert_eq!(
        second,
        workflow_session::SessionOutcome::Reused {
            session_id: "sess-A".to_string()
        }
    );
}

#[tokio::test]
async fn failed_creation_can_be_retried() {
    let manager = memory_manager(fast_config());
    let cancel = CancellationToken::new();

    let err = manager
        .get_or_create("wf-retry", &cancel, |_| async {
            Err(anyhow::anyhow!("backend session failed to start"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Creator(_)));
    assert_eq!(manager.get("wf-retry", &cancel).await.unwrap(), None);

    // Lease was released, so the next caller creates right away
    let outcome = manager
        .get_or_create("wf-retry", &cancel, |_| async { Ok(CreateResult::new("sess-A", "")) })
        .await
        .unwrap();
    assert!(outcome.was_created());
}

#[tokio::test(start_paused = true)]
async fn contended_caller_gives_up_after_wait_timeout() {
    let locker = Arc::new(InMemoryLocker::new());
    let manager = Manager::new(
        ManagerConfig::builder()
            .lock_ttl(Duration::from_secs(60))
            .lock_wait_timeout(Duration::from_secs(1))
            .lock_retry_interval(Duration::from_millis(100))
            .build()
            .unwrap(),
        Arc::new(InMemoryMappingStore::new()),
        locker.clone(),
    );

    // Someone else holds the lease and never publishes
    let _held = locker
        .try_lock("wf-stuck", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let cancel = CancellationToken::new();
    let err = manager
        .get_or_create("wf-stuck", &cancel, |_| async { Ok(CreateResult::new("sess-A", "")) })
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::LockTimeout(d) if d == Duration::from_secs(1)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn degrades_to_memory_when_remote_is_unreachable() {
    let memory_store = Arc::new(InMemoryMappingStore::new());
    let manager = Manager::new(
        fast_config(),
        Arc::new(FallbackMappingStore::new(
            Some(Arc::new(UnreachableStore)),
            Some(memory_store.clone()),
        )),
        Arc::new(FallbackLocker::new(
            Some(Arc::new(UnreachableLocker)),
            Some(Arc::new(InMemoryLocker::new())),
        )),
    );
    let cancel = CancellationToken::new();

    let outcome = manager
        .get_or_create("wf-degraded", &cancel, |_| async {
            Ok(CreateResult::new("sess-A", ""))
        })
        .await
        .unwrap();
    assert!(outcome.was_created());
    assert_eq!(memory_store.get("wf-degraded").await.unwrap().as_deref(), Some("sess-A"));

    let reused = manager
        .get_or_create("wf-degraded", &cancel, |_| async {
            Ok(CreateResult::new("sess-B", ""))
        })
        .await
        .unwrap();
    assert_eq!(reused.session_id(), "sess-A");
}

#[tokio::test]
async fn remote_failure_without_fallback_is_surfaced() {
    let manager = Manager::new(
        fast_config(),
        Arc::new(FallbackMappingStore::new(Some(Arc::new(UnreachableStore)), None)),
        Arc::new(InMemoryLocker::new()),
    );
    let cancel = CancellationToken::new();

    let err = manager.get("wf-1", &cancel).await.unwrap_err();
    assert!(matches!(err, SessionError::Store(StoreError::Timeout(_))));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn mapping_expires_after_ttl() {
    let store = InMemoryMappingStore::new();
    store.set("wf-ttl", "sess-A", Duration::from_millis(50)).await.unwrap();
    assert_eq!(store.get("wf-ttl").await.unwrap().as_deref(), Some("sess-A"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get("wf-ttl").await.unwrap(), None);
}

#[tokio::test]
async fn lease_is_exclusive_until_released() {
    let locker = InMemoryLocker::new();
    let ttl = Duration::from_secs(30);

    let first = locker.try_lock("wf-lease", ttl).await.unwrap().unwrap();
    assert!(locker.try_lock("wf-lease", ttl).await.unwrap().is_none());

    first.unlock().await.unwrap();
    let second = locker.try_lock("wf-lease", ttl).await.unwrap();
    assert!(second.is_some());
}

#[tokio::test(start_paused = true)]
async fn stale_holder_cannot_release_new_lease() {
    let locker = InMemoryLocker::new();

    let stale = locker
        .try_lock("wf-stale", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let _current = locker
        .try_lock("wf-stale", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(stale.unlock().await, Err(LockError::NotOwner)));
    assert!(locker.is_locked("wf-stale"));
}
