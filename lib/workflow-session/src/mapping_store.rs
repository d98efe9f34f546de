// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Workflow-run to session mapping storage
//!
//! A mapping associates one workflow run with the session that serves it.
//! Entries carry a TTL and are refreshed on every read through [`MappingStore::touch`].
//! `set` overwrites unconditionally; uniqueness of the created session is the
//! job of the lock, not of the store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Errors from mapping store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Rejected before reaching the backend
    #[error("Invalid mapping input: {0}")]
    InvalidInput(String),

    /// No backend was able to serve the request
    #[error("Mapping store unavailable")]
    Unavailable,

    /// Backend command did not complete in time
    #[error("Mapping store command timed out after {0:?}")]
    Timeout(Duration),

    /// Backend error
    #[error("Mapping store backend error: {0}")]
    BackendError(String),
}

pub(crate) fn validate_workflow_run_id(workflow_run_id: &str) -> Result<(), StoreError> {
    if workflow_run_id.is_empty() {
        return Err(StoreError::InvalidInput(
            "workflow run id is required".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_ttl(ttl: Duration) -> Result<(), StoreError> {
    if ttl.is_zero() {
        return Err(StoreError::InvalidInput("ttl must be positive".to_string()));
    }
    Ok(())
}

/// TTL-backed association from workflow-run ID to session ID.
///
/// # Contract
///
/// - `get` returns `Ok(None)` when no live mapping exists. Absence is not an error.
/// - `set` requires a non-empty workflow-run ID, a non-empty session ID and a
///   positive TTL, and replaces any prior entry.
/// - `touch` extends the TTL of an existing entry and is a no-op when the
///   entry does not exist.
///
/// Implementations never retry; retry policy belongs to the caller.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, workflow_run_id: &str) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        workflow_run_id: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn touch(&self, workflow_run_id: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct MappingEntry {
    session_id: String,
    expires_at: Instant,
}

/// In-process mapping store for single-instance deployments, tests, and as
/// the fallback tier behind a remote store.
///
/// Expired entries are evicted lazily on `get`; there is no background sweep.
#[derive(Default)]
pub struct InMemoryMappingStore {
    entries: Mutex<HashMap<String, MappingEntry>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn get(&self, workflow_run_id: &str) -> Result<Option<String>, StoreError> {
        validate_workflow_run_id(workflow_run_id)?;

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(workflow_run_id) else {
            return Ok(None);
        };
        if Instant::now() >= entry.expires_at {
            entries.remove(workflow_run_id);
            return Ok(None);
        }
        Ok(Some(entry.session_id.clone()))
    }

    async fn set(
        &self,
        workflow_run_id: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        validate_workflow_run_id(workflow_run_id)?;
        if session_id.is_empty() {
            return Err(StoreError::InvalidInput(
                "session id is required".to_string(),
            ));
        }
        validate_ttl(ttl)?;

        self.entries.lock().insert(
            workflow_run_id.to_string(),
            MappingEntry {
                session_id: session_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn touch(&self, workflow_run_id: &str, ttl: Duration) -> Result<(), StoreError> {
        validate_workflow_run_id(workflow_run_id)?;
        validate_ttl(ttl)?;

        if let Some(entry) = self.entries.lock().get_mut(workflow_run_id) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = InMemoryMappingStore::new();

        store
            .set("wf-1", "sess-A", Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(store.get("wf-1").await.unwrap().as_deref(), Some("sess-A"));
        assert_eq!(store.get("wf-2").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_and_is_evicted() {
        let store = InMemoryMappingStore::new();

        store
            .set("wf-1", "sess-A", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("wf-1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_ttl() {
        let store = InMemoryMappingStore::new();

        store
            .set("wf-1", "sess-A", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.touch("wf-1", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 80ms after set, but only 40ms after touch
        assert_eq!(store.get("wf-1").await.unwrap().as_deref(), Some("sess-A"));
    }

    #[tokio::test]
    async fn test_touch_missing_is_noop() {
        let store = InMemoryMappingStore::new();

        store.touch("missing", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryMappingStore::new();

        store.set("wf-1", "sess-A", Duration::from_secs(60)).await.unwrap();
        store.set("wf-1", "sess-B", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("wf-1").await.unwrap().as_deref(), Some("sess-B"));
    }

    #[rstest]
    #[case("", "sess", Duration::from_secs(1))]
    #[case("wf", "", Duration::from_secs(1))]
    #[case("wf", "sess", Duration::ZERO)]
    #[tokio::test]
    async fn test_set_rejects_invalid_input(
        #[case] workflow_run_id: &str,
        #[case] session_id: &str,
        #[case] ttl: Duration,
    ) {
        let store = InMemoryMappingStore::new();
        let result = store.set(workflow_run_id, session_id, ttl).await;
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_rejects_empty_id() {
        let store = InMemoryMappingStore::new();
        assert!(matches!(
            store.get("").await,
            Err(StoreError::InvalidInput(_))
        ));
    }
}
