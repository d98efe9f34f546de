// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Redis lease lock for cross-replica session creation
//!
//! - Acquire: `SET key token NX EX ttl` (only if absent, with expiry)
//! - Release: Lua compare-and-delete, so only the current owner deletes

use async_trait::async_trait;
use std::time::Duration;

use crate::keys::SessionKeyer;
use crate::redis_client::{RedisClient, expiry_args, with_deadline};
use crate::session_lock::{LockError, LockHandle, Locker, new_lock_token, validate_lock_request};

/// Lua script for safe lock release (only release if we own it)
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`Locker`].
///
/// The returned handle keeps the owner token private. A release that deletes
/// nothing means the lease lapsed (and may belong to another holder now) and
/// is reported as [`LockError::NotOwner`].
pub struct RedisLocker {
    client: RedisClient,
    keyer: SessionKeyer,
    release_script: redis::Script,
}

impl RedisLocker {
    pub fn new(client: RedisClient, keyer: SessionKeyer) -> Self {
        Self {
            client,
            keyer,
            release_script: redis::Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    pub fn keyer(&self) -> &SessionKeyer {
        &self.keyer
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn try_lock(
        &self,
        workflow_run_id: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        validate_lock_request(workflow_run_id, ttl)?;

        let key = self.keyer.lock_key(workflow_run_id);
        let token = new_lock_token();
        let (unit, amount) = expiry_args(ttl);

        let acquired: Option<String> = with_deadline(
            self.client.write_timeout(),
            async {
                let mut conn = self
                    .client
                    .connection()
                    .await
                    .map_err(LockError::BackendError)?;

                // SET key value NX EX seconds
                // NX = only set if not exists
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&token)
                    .arg("NX")
                    .arg(unit)
                    .arg(amount)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| LockError::BackendError(format!("Failed to acquire lock: {e}")))
            },
            LockError::Timeout,
        )
        .await?;

        if acquired.is_none() {
            return Ok(None);
        }

        tracing::debug!(key = %key, "Acquired workflow lock");
        Ok(Some(Box::new(RedisLockHandle {
            client: self.client.clone(),
            release_script: self.release_script.clone(),
            key,
            token,
        })))
    }
}

struct RedisLockHandle {
    client: RedisClient,
    release_script: redis::Script,
    key: String,
    token: String,
}

#[async_trait]
impl LockHandle for RedisLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn unlock(self: Box<Self>) -> Result<(), LockError> {
        let deleted: i64 = with_deadline(
            self.client.write_timeout(),
            async {
                let mut conn = self
                    .client
                    .connection()
                    .await
                    .map_err(LockError::BackendError)?;

                // Atomic check-and-delete
                self.release_script
                    .key(&self.key)
                    .arg(&self.token)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| LockError::BackendError(format!("Failed to release lock: {e}")))
            },
            LockError::Timeout,
        )
        .await?;

        if deleted == 0 {
            return Err(LockError::NotOwner);
        }
        tracing::debug!(key = %self.key, "Released workflow lock");
        Ok(())
    }
}
