// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Workflow session manager
//!
//! Guarantees that, among concurrent requests referencing the same workflow
//! run, at most one creates the underlying session while a lease is held; the
//! others reuse it.
//!
//! # Flow per workflow run
//!
//! 1. Mapping present: refresh its TTL and reuse it.
//! 2. Mapping absent: try the lease.
//!    - Acquired: re-check the mapping, otherwise run the creator and publish
//!      its session ID. The lease is released on every exit path.
//!    - Contended: poll the mapping every `lock_retry_interval` until it
//!      appears or `lock_wait_timeout` elapses, then try the lease once more.
//!      Still contended: [`SessionError::LockTimeout`].
//!
//! All retry policy lives here. Stores and lockers never retry on their own.

use derive_builder::Builder;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mapping_store::{MappingStore, StoreError};
use crate::session_lock::{LockError, LockHandle, Locker};

pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound for every configured duration; keeps deadline arithmetic and
/// store-side expiries in range.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Errors surfaced by [`Manager`]
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Request rejected before touching any store
    #[error("Invalid workflow session request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// Another caller held the lease for the whole wait and never published a
    /// mapping. Expected under heavy contention; try again later.
    #[error("Lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// The caller's cancellation token fired
    #[error("Workflow session operation cancelled")]
    Cancelled,

    /// The session creator failed; carried verbatim
    #[error(transparent)]
    Creator(anyhow::Error),
}

impl SessionError {
    /// Whether the caller should treat this as "try again later" rather than
    /// a hard failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::LockTimeout(_) => true,
            SessionError::Store(e) => !matches!(e, StoreError::InvalidInput(_)),
            SessionError::Lock(e) => !matches!(e, LockError::InvalidInput(_)),
            _ => false,
        }
    }
}

/// Output of a session creator. `session_id` must be non-empty and is the
/// value persisted in the mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateResult {
    pub session_id: String,
    /// Whatever the creator produced alongside the session (e.g. the first
    /// answer). Only returned to the caller that created it.
    pub payload: String,
}

impl CreateResult {
    pub fn new(session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            payload: payload.into(),
        }
    }
}

/// Result of [`Manager::get_or_create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An existing mapping was found and refreshed
    Reused { session_id: String },
    /// This caller won the lease and ran the creator
    Created(CreateResult),
}

impl SessionOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            SessionOutcome::Reused { session_id } => session_id,
            SessionOutcome::Created(result) => &result.session_id,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, SessionOutcome::Created(_))
    }
}

/// Timing settings for a [`Manager`].
///
/// Zero durations are replaced by the defaults when the manager is built.
///
/// # Example
///
/// ```ignore
/// let config = ManagerConfig::builder()
///     .lock_wait_timeout(Duration::from_secs(30))
///     .build()?;
/// ```
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(build_fn(error = "anyhow::Error"))]
pub struct ManagerConfig {
    /// TTL of a published mapping, refreshed on each read.
    ///
    /// Default: 24h
    #[builder(default = "DEFAULT_MAPPING_TTL")]
    pub mapping_ttl: Duration,

    /// Lease length. Should be at least `lock_wait_timeout`, otherwise a lease
    /// can lapse while its holder is still creating.
    ///
    /// Default: 2m
    #[builder(default = "DEFAULT_LOCK_TTL")]
    pub lock_ttl: Duration,

    /// How long a contended caller polls for the winner's mapping.
    ///
    /// Default: 2m
    #[builder(default = "DEFAULT_LOCK_WAIT_TIMEOUT")]
    pub lock_wait_timeout: Duration,

    /// Default: 200ms
    #[builder(default = "DEFAULT_LOCK_RETRY_INTERVAL")]
    pub lock_retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mapping_ttl: DEFAULT_MAPPING_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Replace zero durations with defaults and cap them at [`MAX_DURATION`].
    pub fn resolved(&self) -> Self {
        fn or_default(value: Duration, default: Duration) -> Duration {
            if value.is_zero() { default } else { value.min(MAX_DURATION) }
        }
        Self {
            mapping_ttl: or_default(self.mapping_ttl, DEFAULT_MAPPING_TTL),
            lock_ttl: or_default(self.lock_ttl, DEFAULT_LOCK_TTL),
            lock_wait_timeout: or_default(self.lock_wait_timeout, DEFAULT_LOCK_WAIT_TIMEOUT),
            lock_retry_interval: or_default(self.lock_retry_interval, DEFAULT_LOCK_RETRY_INTERVAL),
        }
    }

    /// Configuration lints. Reported, never auto-corrected.
    pub fn warnings(&self) -> Vec<String> {
        let resolved = self.resolved();
        let mut warnings = Vec::new();
        if resolved.lock_ttl < resolved.lock_wait_timeout {
            warnings.push(format!(
                "lock_ttl ({:?}) is shorter than lock_wait_timeout ({:?}); a lease can lapse \
                 while its holder is still creating and admit a second creator",
                resolved.lock_ttl, resolved.lock_wait_timeout
            ));
        }
        warnings
    }
}

/// Coordinates session creation per workflow run.
///
/// Cheap to clone; clones share the same store and locker.
#[derive(Clone)]
pub struct Manager {
    store: Arc<dyn MappingStore>,
    locker: Arc<dyn Locker>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(config: ManagerConfig, store: Arc<dyn MappingStore>, locker: Arc<dyn Locker>) -> Self {
        for warning in config.warnings() {
            tracing::warn!("Workflow session config: {warning}");
        }
        Self {
            store,
            locker,
            config: config.resolved(),
        }
    }

    /// Effective configuration, with defaults applied.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Look up the session mapped to a workflow run without creating one.
    ///
    /// A found mapping has its TTL refreshed.
    pub async fn get(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SessionError> {
        validate_workflow_run_id(workflow_run_id)?;
        self.lookup(workflow_run_id, cancel).await
    }

    /// Return the session mapped to a workflow run, creating it through
    /// `creator` if no mapping exists and this caller wins the lease.
    ///
    /// `creator` receives a child of `cancel` and must return a non-empty
    /// session ID. Its error aborts creation without writing a mapping.
    ///
    /// # Errors
    /// * `SessionError::LockTimeout` - contended for the full wait; retry later
    /// * `SessionError::Cancelled` - `cancel` fired
    /// * `SessionError::Creator` - the creator failed; the lease was released
    /// * `SessionError::InvalidInput` - empty workflow run ID, or the creator
    ///   returned an empty session ID
    pub async fn get_or_create<F, Fut>(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
        creator: F,
    ) -> Result<SessionOutcome, SessionError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<CreateResult>> + Send,
    {
        validate_workflow_run_id(workflow_run_id)?;

        if let Some(session_id) = self.lookup(workflow_run_id, cancel).await? {
            return Ok(SessionOutcome::Reused { session_id });
        }

        if let Some(handle) = self.try_lock(workflow_run_id, cancel).await? {
            return self
                .create_with_lock(workflow_run_id, handle, cancel, creator)
                .await;
        }

        tracing::debug!(workflow_run_id, "Workflow lock contended, waiting for mapping");
        if let Some(session_id) = self.wait_for_mapping(workflow_run_id, cancel).await? {
            return Ok(SessionOutcome::Reused { session_id });
        }
        if let Some(session_id) = self.lookup(workflow_run_id, cancel).await? {
            return Ok(SessionOutcome::Reused { session_id });
        }

        tracing::warn!(workflow_run_id, "Workflow mapping not found after wait, retrying lock");
        match self.try_lock(workflow_run_id, cancel).await? {
            Some(handle) => {
                self.create_with_lock(workflow_run_id, handle, cancel, creator)
                    .await
            }
            None => Err(SessionError::LockTimeout(self.config.lock_wait_timeout)),
        }
    }

    async fn lookup(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SessionError> {
        let found = guarded(cancel, self.store.get(workflow_run_id)).await?;
        if found.is_some() {
            self.touch(workflow_run_id, cancel).await;
        }
        Ok(found)
    }

    async fn touch(&self, workflow_run_id: &str, cancel: &CancellationToken) {
        let touched = guarded(
            cancel,
            self.store.touch(workflow_run_id, self.config.mapping_ttl),
        )
        .await;
        if let Err(e) = touched {
            tracing::warn!(workflow_run_id, "Workflow mapping touch failed: {e}");
        }
    }

    async fn try_lock(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn LockHandle>>, SessionError> {
        guarded(
            cancel,
            self.locker.try_lock(workflow_run_id, self.config.lock_ttl),
        )
        .await
    }

    async fn wait_for_mapping(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SessionError> {
        let deadline = Instant::now() + self.config.lock_wait_timeout;
        while Instant::now() < deadline {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(self.config.lock_retry_interval) => {}
            }
            if let Some(session_id) = self.lookup(workflow_run_id, cancel).await? {
                return Ok(Some(session_id));
            }
        }
        Ok(None)
    }

    async fn create_with_lock<F, Fut>(
        &self,
        workflow_run_id: &str,
        handle: Box<dyn LockHandle>,
        cancel: &CancellationToken,
        creator: F,
    ) -> Result<SessionOutcome, SessionError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<CreateResult>> + Send,
    {
        let guard = ReleaseGuard::new(handle);
        let outcome = self.create_locked(workflow_run_id, cancel, creator).await;
        guard.release().await;
        outcome
    }

    async fn create_locked<F, Fut>(
        &self,
        workflow_run_id: &str,
        cancel: &CancellationToken,
        creator: F,
    ) -> Result<SessionOutcome, SessionError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<CreateResult>> + Send,
    {
        // Another winner may have published between our miss and our lease
        if let Some(session_id) = self.lookup(workflow_run_id, cancel).await? {
            return Ok(SessionOutcome::Reused { session_id });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = creator(cancel.child_token()) => result.map_err(SessionError::Creator)?,
        };
        if result.session_id.is_empty() {
            return Err(SessionError::InvalidInput(
                "session id is required from creator".to_string(),
            ));
        }

        guarded(
            cancel,
            self.store
                .set(workflow_run_id, &result.session_id, self.config.mapping_ttl),
        )
        .await?;

        tracing::debug!(
            workflow_run_id,
            session_id = %result.session_id,
            "Created workflow session"
        );
        Ok(SessionOutcome::Created(result))
    }
}

fn validate_workflow_run_id(workflow_run_id: &str) -> Result<(), SessionError> {
    if workflow_run_id.is_empty() {
        return Err(SessionError::InvalidInput(
            "workflow run id is required".to_string(),
        ));
    }
    Ok(())
}

/// Race a store or lock call against cancellation.
async fn guarded<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    SessionError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => result.map_err(SessionError::from),
    }
}

/// Releases a held lease exactly once.
///
/// The normal path awaits [`ReleaseGuard::release`]. If the owning future is
/// dropped mid-creation, `Drop` hands the release to the runtime instead.
struct ReleaseGuard {
    handle: Option<Box<dyn LockHandle>>,
}

impl ReleaseGuard {
    fn new(handle: Box<dyn LockHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            unlock_logged(handle).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(unlock_logged(handle));
            }
            Err(_) => {
                tracing::warn!(key = handle.key(), "No tokio runtime to release workflow lock; lease will lapse");
            }
        }
    }
}

async fn unlock_logged(handle: Box<dyn LockHandle>) {
    let key = handle.key().to_string();
    if let Err(e) = handle.unlock().await {
        tracing::warn!(key = %key, "Workflow lock release failed: {e}");
    }
}
