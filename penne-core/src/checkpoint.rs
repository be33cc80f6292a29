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

//! Checkpoint persistence.
//!
//! A checkpoint is the `_data` string of the last event every sink
//! delivered. [`CheckpointStore`] is a dumb byte-oriented backend (local
//! file, S3, GCS, memory); [`RateLimitedCheckpointWriter`] owns the single
//! checkpoint key of a deployment and decides when a write actually reaches
//! the store.
//!
//! # Example
//!
//! ```rust
//! use penne_core::checkpoint::{checkpoint_key, RateLimitedCheckpointWriter, SaveOutcome};
//! # use penne_core::checkpoint::{CheckpointError, CheckpointStore};
//! # use std::sync::Arc;
//! # struct Null;
//! # #[async_trait::async_trait]
//! # impl CheckpointStore for Null {
//! #     async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
//! #         Err(CheckpointError::NotFound(key.to_string()))
//! #     }
//! #     async fn put(&self, _: &str, _: &[u8]) -> Result<(), CheckpointError> { Ok(()) }
//! #     async fn delete(&self, _: &str) -> Result<(), CheckpointError> { Ok(()) }
//! #     fn backend(&self) -> &'static str { "null" }
//! # }
//! # async fn example() -> Result<(), CheckpointError> {
//! let key = checkpoint_key("/var/lib/penne/", "orders.dat");
//! assert_eq!(key, "/var/lib/penne/orders.dat");
//!
//! let writer = RateLimitedCheckpointWriter::new(Arc::new(Null), key, std::time::Duration::ZERO);
//! assert_eq!(writer.maybe_save("8263A1").await?, SaveOutcome::Written);
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Errors that can occur in checkpoint backends.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// No checkpoint is stored under the key
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes are not a valid checkpoint
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Other errors
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

impl CheckpointError {
    /// Returns true for [`CheckpointError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Trait for checkpoint storage backends.
///
/// Backends perform no concurrency control; the relay serializes all
/// checkpoint writes through one [`RateLimitedCheckpointWriter`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if nothing is stored under the
    /// key, or another variant if the backend failed.
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be persisted.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError>;

    /// Removes the value stored under `key`. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend failed.
    async fn delete(&self, key: &str) -> Result<(), CheckpointError>;

    /// Backend label for logs and metrics ("file", "s3", ...).
    fn backend(&self) -> &'static str;
}

/// Default checkpoint file name for a collection.
#[must_use]
pub fn default_file_name(collection: &str) -> String {
    format!("{collection}.dat")
}

/// Builds the lexically cleaned key `<dir>/<file_name>`.
///
/// Repeated separators and `.` segments are removed and `..` segments are
/// resolved. An empty directory yields a key rooted at `/`, and a relative
/// directory stays relative.
#[must_use]
pub fn checkpoint_key(dir: &str, file_name: &str) -> String {
    clean_path(&format!("{dir}/{file_name}"))
}

fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Outcome of [`RateLimitedCheckpointWriter::maybe_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The checkpoint reached the store.
    Written,
    /// The write was skipped because the minimum interval has not elapsed.
    Throttled,
}

#[derive(Debug, Default)]
struct WriterState {
    last_saved_at: Option<Instant>,
    pending: Option<String>,
}

/// Wraps a [`CheckpointStore`] with a minimum interval between writes.
///
/// - A zero interval writes on every call.
/// - Otherwise a write happens only when no successful write has happened
///   yet or when at least `min_interval` has elapsed since the last one.
/// - A throttled checkpoint is remembered and written by
///   [`flush_pending`](Self::flush_pending), which the loop calls when it
///   stops cleanly.
/// - A failed write leaves the last-saved time untouched and is returned
///   to the caller.
pub struct RateLimitedCheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    key: String,
    min_interval: Duration,
    state: Mutex<WriterState>,
}

impl RateLimitedCheckpointWriter {
    /// Creates a writer for one checkpoint key.
    pub fn new(store: Arc<dyn CheckpointStore>, key: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            min_interval,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// The checkpoint key this writer owns.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The configured minimum interval.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reads the stored checkpoint.
    ///
    /// Absence and read failures both yield `None`; they differ only in how
    /// they are logged. Trailing newlines are trimmed and an empty value
    /// counts as absent.
    pub async fn load(&self) -> Option<String> {
        let bytes = match self.store.get(&self.key).await {
            Ok(bytes) => bytes,
            Err(CheckpointError::NotFound(_)) => {
                info!(key = %self.key, backend = self.store.backend(), "No stored checkpoint");
                return None;
            }
            Err(e) => {
                warn!(key = %self.key, backend = self.store.backend(), error = %e, "Failed to read checkpoint, starting from the current position");
                return None;
            }
        };

        let value = match String::from_utf8(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Stored checkpoint is not valid UTF-8, ignoring it");
                return None;
            }
        };

        let value = value.trim_end_matches(['\n', '\r']);
        if value.is_empty() {
            debug!(key = %self.key, "Stored checkpoint is empty");
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Writes `checkpoint` unless the last write is younger than the
    /// minimum interval.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write was attempted and failed.
    pub async fn maybe_save(&self, checkpoint: &str) -> Result<SaveOutcome, CheckpointError> {
        let mut state = self.state.lock().await;

        if !self.min_interval.is_zero() {
            if let Some(last) = state.last_saved_at {
                if Instant::now() < last + self.min_interval {
                    trace!(checkpoint, "Checkpoint write throttled");
                    metrics::increment_checkpoint_throttled();
                    state.pending = Some(checkpoint.to_string());
                    return Ok(SaveOutcome::Throttled);
                }
            }
        }

        self.write(&mut state, checkpoint).await?;
        Ok(SaveOutcome::Written)
    }

    /// Writes the most recent throttled checkpoint, if any, regardless of
    /// the interval. Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write failed; the checkpoint stays
    /// pending.
    pub async fn flush_pending(&self) -> Result<bool, CheckpointError> {
        let mut state = self.state.lock().await;
        let Some(checkpoint) = state.pending.clone() else {
            return Ok(false);
        };
        self.write(&mut state, &checkpoint).await?;
        Ok(true)
    }

    /// When the last successful write happened.
    pub async fn last_saved_at(&self) -> Option<Instant> {
        self.state.lock().await.last_saved_at
    }

    async fn write(&self, state: &mut WriterState, checkpoint: &str) -> Result<(), CheckpointError> {
        let backend = self.store.backend();
        if let Err(e) = self.store.put(&self.key, checkpoint.as_bytes()).await {
            metrics::increment_checkpoint_write_errors(backend);
            return Err(e);
        }

        metrics::increment_checkpoint_writes(backend);
        debug!(key = %self.key, checkpoint, backend, "Checkpoint saved");
        state.last_saved_at = Some(Instant::now());
        state.pending = None;
        Ok(())
    }
}
