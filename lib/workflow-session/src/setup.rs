// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Composition root: build a [`Manager`] from [`WorkflowSessionConfig`].
//!
//! The in-memory store and locker are always created. When Redis is
//! configured and answers a PING within the dial timeout it becomes the
//! primary and memory the fallback; otherwise the manager runs memory-only.
//! Construction never fails.

use std::sync::Arc;

use crate::config::WorkflowSessionConfig;
use crate::fallback::{FallbackLocker, FallbackMappingStore};
use crate::manager::Manager;
use crate::mapping_store::{InMemoryMappingStore, MappingStore};
use crate::session_lock::{InMemoryLocker, Locker};

pub async fn build_manager(config: &WorkflowSessionConfig) -> Manager {
    // Lints are reported by Manager::new
    let config = config.clone().with_defaults();

    let memory_store: Arc<dyn MappingStore> = Arc::new(InMemoryMappingStore::new());
    let memory_locker: Arc<dyn Locker> = Arc::new(InMemoryLocker::new());

    let (store, locker) = match connect_remote(&config).await {
        Some((remote_store, remote_locker)) => {
            tracing::info!(
                config = ?config.redacted(),
                "Workflow session manager initialized (redis with in-memory fallback)"
            );
            (
                Arc::new(FallbackMappingStore::new(
                    Some(remote_store),
                    Some(memory_store),
                )) as Arc<dyn MappingStore>,
                Arc::new(FallbackLocker::new(Some(remote_locker), Some(memory_locker)))
                    as Arc<dyn Locker>,
            )
        }
        None => {
            tracing::info!(
                config = ?config.redacted(),
                "Workflow session manager initialized (in-memory)"
            );
            (memory_store, memory_locker)
        }
    };

    Manager::new(config.manager_config(), store, locker)
}

#[cfg(feature = "redis-storage")]
async fn connect_remote(
    config: &WorkflowSessionConfig,
) -> Option<(Arc<dyn MappingStore>, Arc<dyn Locker>)> {
    use crate::keys::SessionKeyer;
    use crate::redis_client::RedisClient;
    use crate::redis_lock::RedisLocker;
    use crate::redis_mapping_store::RedisMappingStore;

    let settings = config.redis.as_ref().filter(|r| r.is_enabled())?;
    match RedisClient::connect(&settings.to_client_config()).await {
        Ok(client) => Some((
            Arc::new(RedisMappingStore::new(client.clone(), SessionKeyer::default())),
            Arc::new(RedisLocker::new(client, SessionKeyer::default())),
        )),
        Err(e) => {
            tracing::warn!(
                addr = %settings.addr,
                "Redis unavailable for workflow sessions, using in-memory only: {e}"
            );
            None
        }
    }
}

#[cfg(not(feature = "redis-storage"))]
async fn connect_remote(
    config: &WorkflowSessionConfig,
) -> Option<(Arc<dyn MappingStore>, Arc<dyn Locker>)> {
    if config.redis.as_ref().is_some_and(|r| r.is_enabled()) {
        tracing::warn!("Redis configured but redis-storage feature is disabled, using in-memory only");
    }
    None
}
