// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Redis mapping store for multi-replica deployments
//!
//! Each mapping is a single string value with a store-native TTL:
//! `{prefix}:{workflow_run_id}:session` -> session ID.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

use crate::keys::SessionKeyer;
use crate::mapping_store::{MappingStore, StoreError, validate_ttl, validate_workflow_run_id};
use crate::redis_client::{RedisClient, expiry_args, with_deadline};

/// Redis-backed [`MappingStore`].
///
/// # Example
///
/// ```ignore
/// use workflow_session::{RedisClient, RedisConfig, RedisMappingStore, SessionKeyer};
///
/// let client = RedisClient::connect(&RedisConfig::default()).await?;
/// let store = RedisMappingStore::new(client, SessionKeyer::default());
/// store.set("wf-1", "sess-A", Duration::from_secs(3600)).await?;
/// ```
pub struct RedisMappingStore {
    client: RedisClient,
    keyer: SessionKeyer,
}

impl RedisMappingStore {
    pub fn new(client: RedisClient, keyer: SessionKeyer) -> Self {
        Self { client, keyer }
    }

    pub fn keyer(&self) -> &SessionKeyer {
        &self.keyer
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.client
            .connection()
            .await
            .map_err(StoreError::BackendError)
    }
}

#[async_trait]
impl MappingStore for RedisMappingStore {
    async fn get(&self, workflow_run_id: &str) -> Result<Option<String>, StoreError> {
        validate_workflow_run_id(workflow_run_id)?;
        let key = self.keyer.mapping_key(workflow_run_id);

        with_deadline(
            self.client.read_timeout(),
            async {
                let mut conn = self.connection().await?;
                conn.get::<_, Option<String>>(&key)
                    .await
                    .map_err(|e| StoreError::BackendError(format!("Failed to get mapping: {e}")))
            },
            StoreError::Timeout,
        )
        .await
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
        let key = self.keyer.mapping_key(workflow_run_id);
        let (unit, amount) = expiry_args(ttl);

        with_deadline(
            self.client.write_timeout(),
            async {
                let mut conn = self.connection().await?;
                // SET key value EX seconds (PX for sub-second TTLs)
                redis::cmd("SET")
                    .arg(&key)
                    .arg(session_id)
                    .arg(unit)
                    .arg(amount)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| StoreError::BackendError(format!("Failed to store mapping: {e}")))
            },
            StoreError::Timeout,
        )
        .await
    }

    async fn touch(&self, workflow_run_id: &str, ttl: Duration) -> Result<(), StoreError> {
        validate_workflow_run_id(workflow_run_id)?;
        validate_ttl(ttl)?;
        let key = self.keyer.mapping_key(workflow_run_id);

        let applied = with_deadline(
            self.client.write_timeout(),
            async {
                let mut conn = self.connection().await?;
                let result = if ttl.subsec_nanos() == 0 {
                    conn.expire::<_, bool>(&key, ttl.as_secs() as i64).await
                } else {
                    conn.pexpire::<_, bool>(&key, (ttl.as_millis() as i64).max(1))
                        .await
                };
                result.map_err(|e| {
                    StoreError::BackendError(format!("Failed to refresh mapping TTL: {e}"))
                })
            },
            StoreError::Timeout,
        )
        .await?;

        // EXPIRE on a missing key reports 0; nothing to refresh
        if !applied {
            tracing::trace!(workflow_run_id, "Touch skipped, mapping not present");
        }
        Ok(())
    }
}
