// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Workflow-run to session coordination.
//!
//! Many concurrent requests may reference the same workflow run. This crate
//! makes sure at most one of them creates the backing session while the others
//! wait for and reuse the published `workflow_run_id -> session_id` mapping.
//!
//! - [`MappingStore`]: TTL mapping, in-memory or Redis
//! - [`Locker`]: lease lock with owner-checked release, in-memory or Redis
//! - [`FallbackMappingStore`] / [`FallbackLocker`]: prefer the remote store,
//!   degrade to memory when it errors
//! - [`Manager`]: the `get` / `get_or_create` flow built on top
//! - [`setup::build_manager`]: wiring from [`WorkflowSessionConfig`]

pub mod config;
pub mod fallback;
pub mod keys;
pub mod manager;
pub mod mapping_store;
pub mod session_lock;
pub mod setup;

#[cfg(feature = "redis-storage")]
pub mod redis_client;
#[cfg(feature = "redis-storage")]
pub mod redis_lock;
#[cfg(feature = "redis-storage")]
pub mod redis_mapping_store;

pub use config::{RedisSettings, WorkflowSessionConfig};
pub use fallback::{FallbackLocker, FallbackMappingStore};
pub use keys::{DEFAULT_KEY_PREFIX, SessionKeyer};
pub use manager::{
    CreateResult, DEFAULT_LOCK_RETRY_INTERVAL, DEFAULT_LOCK_TTL, DEFAULT_LOCK_WAIT_TIMEOUT,
    DEFAULT_MAPPING_TTL, MAX_DURATION, Manager, ManagerConfig, ManagerConfigBuilder, SessionError,
    SessionOutcome,
};
pub use mapping_store::{InMemoryMappingStore, MappingStore, StoreError};
pub use session_lock::{InMemoryLocker, LockError, LockHandle, Locker};
pub use setup::build_manager;

#[cfg(feature = "redis-storage")]
pub use redis_client::{RedisClient, RedisClientError, RedisConfig};
#[cfg(feature = "redis-storage")]
pub use redis_lock::RedisLocker;
#[cfg(feature = "redis-storage")]
pub use redis_mapping_store::RedisMappingStore;
