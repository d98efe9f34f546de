// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Primary/secondary combinators for surviving an unreachable remote store
//!
//! The degradation is asymmetric and must stay that way:
//! - Reads and lock attempts go to the primary and fall through to the
//!   secondary only when the primary *errors*. "Not found" and "not acquired"
//!   are answers, not failures.
//! - Writes go to the primary. On success the secondary receives a
//!   best-effort mirror whose outcome is ignored. On primary failure the
//!   secondary write becomes the authoritative one and its result is returned.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::mapping_store::{MappingStore, StoreError};
use crate::session_lock::{LockError, LockHandle, Locker};

/// [`MappingStore`] that prefers `primary` and degrades to `secondary`.
#[derive(Clone, Default)]
pub struct FallbackMappingStore {
    primary: Option<Arc<dyn MappingStore>>,
    secondary: Option<Arc<dyn MappingStore>>,
}

impl FallbackMappingStore {
    pub fn new(
        primary: Option<Arc<dyn MappingStore>>,
        secondary: Option<Arc<dyn MappingStore>>,
    ) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl MappingStore for FallbackMappingStore {
    async fn get(&self, workflow_run_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(workflow_run_id).await {
                Ok(found) => return Ok(found),
                Err(e) if self.secondary.is_none() => return Err(e),
                Err(e) => {
                    tracing::warn!("Primary mapping store get failed, using secondary: {e}");
                }
            }
        }
        match &self.secondary {
            Some(secondary) => secondary.get(workflow_run_id).await,
            None => Err(StoreError::Unavailable),
        }
    }

    async fn set(
        &self,
        workflow_run_id: &str,
        session_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        match (&self.primary, &self.secondary) {
            (None, None) => Err(StoreError::Unavailable),
            (None, Some(only)) | (Some(only), None) => {
                only.set(workflow_run_id, session_id, ttl).await
            }
            (Some(primary), Some(secondary)) => {
                match primary.set(workflow_run_id, session_id, ttl).await {
                    Ok(()) => {
                        if let Err(e) = secondary.set(workflow_run_id, session_id, ttl).await {
                            tracing::debug!("Mapping mirror write to secondary failed: {e}");
                        }
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("Primary mapping store set failed, using secondary: {e}");
                        secondary.set(workflow_run_id, session_id, ttl).await
                    }
                }
            }
        }
    }

    async fn touch(&self, workflow_run_id: &str, ttl: Duration) -> Result<(), StoreError> {
        match (&self.primary, &self.secondary) {
            (None, None) => Err(StoreError::Unavailable),
            (None, Some(only)) | (Some(only), None) => only.touch(workflow_run_id, ttl).await,
            (Some(primary), Some(secondary)) => match primary.touch(workflow_run_id, ttl).await {
                Ok(()) => {
                    if let Err(e) = secondary.touch(workflow_run_id, ttl).await {
                        tracing::debug!("Mapping mirror touch on secondary failed: {e}");
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!("Primary mapping store touch failed, using secondary: {e}");
                    secondary.touch(workflow_run_id, ttl).await
                }
            },
        }
    }
}

/// [`Locker`] that prefers `primary` and degrades to `secondary`.
///
/// A lease taken on the secondary only excludes callers that also degraded to
/// the same secondary. That is the accepted cost of staying available.
#[derive(Clone, Default)]
pub struct FallbackLocker {
    primary: Option<Arc<dyn Locker>>,
    secondary: Option<Arc<dyn Locker>>,
}

impl FallbackLocker {
    pub fn new(primary: Option<Arc<dyn Locker>>, secondary: Option<Arc<dyn Locker>>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Locker for FallbackLocker {
    async fn try_lock(
        &self,
        workflow_run_id: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        if let Some(primary) = &self.primary {
            match primary.try_lock(workflow_run_id, ttl).await {
                Ok(handle) => return Ok(handle),
                Err(e) if self.secondary.is_none() => return Err(e),
                Err(e) => {
                    tracing::warn!("Primary locker failed, using secondary: {e}");
                }
            }
        }
        match &self.secondary {
            Some(secondary) => secondary.try_lock(workflow_run_id, ttl).await,
            None => Err(LockError::Unavailable),
        }
    }
}
