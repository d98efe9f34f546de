// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key layout for workflow-run state in a shared key-value store.
//!
//! Two plain string keys exist per workflow run:
//! - Mapping: `{prefix}:{workflow_run_id}:session` -> session ID
//! - Lock: `{prefix}:{workflow_run_id}:lock` -> owner token
//!
//! Operators inspect and clear these by hand, so the shape is stable.

/// Default namespace prefix for workflow-run keys.
pub const DEFAULT_KEY_PREFIX: &str = "workflow:run";

const MAPPING_SUFFIX: &str = "session";
const LOCK_SUFFIX: &str = "lock";

/// Derives namespaced mapping and lock keys from a workflow-run ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyer {
    prefix: String,
}

impl Default for SessionKeyer {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl SessionKeyer {
    /// Create a keyer with a custom prefix. An empty prefix falls back to
    /// [`DEFAULT_KEY_PREFIX`].
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Self::default();
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn mapping_key(&self, workflow_run_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, workflow_run_id, MAPPING_SUFFIX)
    }

    pub fn lock_key(&self, workflow_run_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, workflow_run_id, LOCK_SUFFIX)
    }
}
