// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lease locks guarding session creation for a workflow run
//!
//! A lock is a lease: it carries a TTL and lapses on its own if the holder
//! crashes. Every acquisition gets a fresh random owner token that stays inside
//! the returned [`LockHandle`]; release presents that token, so a holder whose
//! lease already lapsed cannot delete a lock that now belongs to someone else.
//!
//! # Usage Pattern
//!
//! ```ignore
//! if let Some(handle) = locker.try_lock("wf-1", Duration::from_secs(120)).await? {
//!     // ... create the session ...
//!     handle.unlock().await?;
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Errors from lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Rejected before reaching the backend
    #[error("Invalid lock input: {0}")]
    InvalidInput(String),

    /// No backend was able to serve the request
    #[error("Lock unavailable")]
    Unavailable,

    /// Release attempted with a token that no longer owns the lease
    #[error("Lock not owned or already released")]
    NotOwner,

    /// Backend command did not complete in time
    #[error("Lock command timed out after {0:?}")]
    Timeout(Duration),

    /// Backend error
    #[error("Lock backend error: {0}")]
    BackendError(String),
}

pub(crate) fn validate_lock_request(workflow_run_id: &str, ttl: Duration) -> Result<(), LockError> {
    if workflow_run_id.is_empty() {
        return Err(LockError::InvalidInput(
            "workflow run id is required".to_string(),
        ));
    }
    if ttl.is_zero() {
        return Err(LockError::InvalidInput("ttl must be positive".to_string()));
    }
    Ok(())
}

/// Generate a fresh 16-byte owner token, hex encoded.
pub(crate) fn new_lock_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Proof of a held lease, returned by [`Locker::try_lock`].
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// The key this handle holds.
    fn key(&self) -> &str;

    /// Release the lease.
    ///
    /// Consumes the handle so release happens at most once. Returns
    /// [`LockError::NotOwner`] when the lease already lapsed or was taken over,
    /// so callers can detect lease expiry.
    async fn unlock(self: Box<Self>) -> Result<(), LockError>;
}

/// Non-blocking lease acquisition.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to acquire the lease for a workflow run.
    ///
    /// # Returns
    /// `Ok(Some(handle))` if acquired, `Ok(None)` if another holder's lease is
    /// still live. Contention is not an error.
    async fn try_lock(
        &self,
        workflow_run_id: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

/// In-process lease lock for single-instance deployments, tests, and as the
/// fallback tier when the remote store is unreachable.
///
/// Only excludes callers within this process. For multiple replicas use
/// `RedisLocker` (feature `redis-storage`).
#[derive(Default)]
pub struct InMemoryLocker {
    locks: LockTable,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a live lease is held for the workflow run.
    pub fn is_locked(&self, workflow_run_id: &str) -> bool {
        self.locks
            .lock()
            .get(workflow_run_id)
            .is_some_and(|entry| Instant::now() < entry.expires_at)
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn try_lock(
        &self,
        workflow_run_id: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        validate_lock_request(workflow_run_id, ttl)?;

        let token = new_lock_token();
        let now = Instant::now();

        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(workflow_run_id) {
            if now < entry.expires_at {
                return Ok(None);
            }
            locks.remove(workflow_run_id);
        }
        locks.insert(
            workflow_run_id.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(Some(Box::new(InMemoryLockHandle {
            locks: self.locks.clone(),
            key: workflow_run_id.to_string(),
            token,
        })))
    }
}

struct InMemoryLockHandle {
    locks: LockTable,
    key: String,
    token: String,
}

#[async_trait]
impl LockHandle for InMemoryLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn unlock(self: Box<Self>) -> Result<(), LockError> {
        let mut locks = self.locks.lock();
        match locks.get(&self.key) {
            Some(entry) if entry.token == self.token && Instant::now() < entry.expires_at => {
                locks.remove(&self.key);
                Ok(())
            }
            // Lapsed or reassigned lease; leave any other holder's entry alone
            _ => Err(LockError::NotOwner),
        }
    }
}
