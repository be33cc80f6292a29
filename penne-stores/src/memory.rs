// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory checkpoint store.
//!
//! Keeps checkpoints in a [`HashMap`] behind an [`RwLock`] and records every
//! `put` so tests can assert on exactly what was written and in which order.
//!
//! ⚠️ Checkpoints are lost when the process exits. Use the file, S3 or GCS
//! store for real deployments.
//!
//! # Example
//!
//! ```rust
//! use penne_stores::memory::MemoryStore;
//! use penne_core::checkpoint::CheckpointStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! store.put("orders.dat", b"826A01").await?;
//!
//! assert_eq!(store.get("orders.dat").await?, b"826A01");
//! assert_eq!(store.put_history().await, vec![("orders.dat".to_string(), b"826A01".to_vec())]);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use penne_core::checkpoint::{CheckpointError, CheckpointStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// In-memory [`CheckpointStore`].
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    history: Arc<RwLock<Vec<(String, Vec<u8>)>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with one value.
    #[must_use]
    pub fn with_value(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let mut values = HashMap::new();
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(RwLock::new(values)),
            history: Arc::default(),
        }
    }

    /// Every successful `put`, oldest first.
    pub async fn put_history(&self) -> Vec<(String, Vec<u8>)> {
        self.history.read().await.clone()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    /// Returns true if no key is stored.
    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        trace!(key, "Reading checkpoint from memory");
        self.values
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError> {
        trace!(key, bytes = value.len(), "Writing checkpoint to memory");
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        self.history
            .write()
            .await
            .push((key.to_string(), value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.values.write().await.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("k", b"v1").await.unwrap();
        store.put("k", b"v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v2");
        assert_eq!(store.put_history().await.len(), 2);

        store.delete("k").await.unwrap();
        assert!(store.is_empty().await);
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::with_value("k", "seed");
        let other = store.clone();
        other.put("k", b"next").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"next");
    }
}
