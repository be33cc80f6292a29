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

//! Bulk index accumulation buffer.
//!
//! [`BulkIndexBuffer`] collects newline-delimited bulk operations (an
//! action/metadata line, optionally followed by a source line) per document
//! key and submits them to a [`BulkApi`] as one request once the buffered
//! size reaches the configured threshold.
//!
//! # Aggregation
//!
//! With aggregation enabled a new operation for a key that already has
//! pending operations replaces the most recent one, so a hot document costs
//! at most one pending operation. With aggregation disabled every operation
//! is kept in arrival order.
//!
//! # Failure handling
//!
//! The buffer is emptied only after the bulk request succeeds. A failed
//! flush keeps every pending entry and is reported to the caller, which must
//! treat its own event as not yet delivered.
//!
//! # Concurrency
//!
//! One `tokio::sync::Mutex` guards the entries and the byte counter and is
//! held across the whole add-check-flush sequence, so a flush always sees a
//! consistent snapshot and concurrent adds wait for it.

use crate::metrics;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default flush threshold in bytes.
pub const DEFAULT_FLUSH_BYTES: usize = 5_000_000;

/// Errors from bulk buffering.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    /// An operation could not be encoded.
    #[error("failed to encode bulk operation: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The bulk request failed. The buffer was kept.
    #[error("bulk flush failed: {message}")]
    Flush {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BulkError {
    /// Creates a flush error from any error type.
    #[must_use]
    pub fn flush(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Flush {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a flush error with a custom message.
    #[must_use]
    pub fn flush_msg(message: impl Into<String>) -> Self {
        Self::Flush {
            message: message.into(),
            source: None,
        }
    }
}

/// The bulk endpoint a buffer flushes into.
#[async_trait]
pub trait BulkApi: Send + Sync {
    /// Submits one newline-delimited bulk payload.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Flush`] if the request failed or any item in it
    /// was rejected.
    async fn bulk(&self, payload: Vec<u8>) -> Result<(), BulkError>;
}

/// Bulk action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkAction {
    /// Create a new document, failing if it exists
    Create,
    /// Index (create or overwrite) a document
    Index,
    /// Partially update a document
    Update,
    /// Delete a document
    Delete,
}

impl BulkAction {
    /// Name of the action in the bulk metadata line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Index => "index",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One pending bulk operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// Action
    pub action: BulkAction,
    /// Target index
    pub index: String,
    /// Grouping key inside the buffer (the document's logical id)
    pub key: String,
    /// `_id` written to the metadata line, if any
    pub document_id: Option<String>,
    /// Source line; ignored for deletes
    pub body: Option<Value>,
}

impl BulkItem {
    /// A `create` of `body` with a server-assigned id.
    pub fn create(index: impl Into<String>, key: impl Into<String>, body: Value) -> Self {
        Self {
            action: BulkAction::Create,
            index: index.into(),
            key: key.into(),
            document_id: None,
            body: Some(body),
        }
    }

    /// An `update` of document `id`, wrapping `doc` as
    /// `{"doc": .., "doc_as_upsert": upsert}`.
    pub fn update(index: impl Into<String>, id: impl Into<String>, doc: Value, upsert: bool) -> Self {
        let id = id.into();
        let mut body = Map::new();
        body.insert("doc".to_string(), doc);
        body.insert("doc_as_upsert".to_string(), Value::Bool(upsert));
        Self {
            action: BulkAction::Update,
            index: index.into(),
            key: id.clone(),
            document_id: Some(id),
            body: Some(Value::Object(body)),
        }
    }

    /// A `delete` of document `id`.
    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            action: BulkAction::Delete,
            index: index.into(),
            key: id.clone(),
            document_id: Some(id),
            body: None,
        }
    }

    /// Serializes the operation as NDJSON lines.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Serialization`] if the body cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, BulkError> {
        let mut meta = Map::new();
        meta.insert("_index".to_string(), Value::String(self.index.clone()));
        if let Some(id) = &self.document_id {
            meta.insert("_id".to_string(), Value::String(id.clone()));
        }
        let mut line = Map::new();
        line.insert(self.action.as_str().to_string(), Value::Object(meta));

        let mut out = serde_json::to_vec(&line)?;
        out.push(b'\n');
        if self.action != BulkAction::Delete {
            if let Some(body) = &self.body {
                serde_json::to_writer(&mut out, body)?;
                out.push(b'\n');
            }
        }
        Ok(out)
    }
}

/// Result of a successful [`BulkIndexBuffer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The operation is pending in the buffer.
    Buffered,
    /// The threshold was reached and the whole buffer, including this
    /// operation, was flushed.
    Flushed,
}

/// Configuration for a [`BulkIndexBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkIndexConfig {
    /// Flush once the buffered size reaches this many bytes
    pub flush_bytes: usize,
    /// Replace the last pending operation for a key instead of appending
    pub aggregation: bool,
    /// Label used in logs and metrics
    pub label: String,
}

impl BulkIndexConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> BulkIndexConfigBuilder {
        BulkIndexConfigBuilder::default()
    }
}

impl Default for BulkIndexConfig {
    fn default() -> Self {
        Self {
            flush_bytes: DEFAULT_FLUSH_BYTES,
            aggregation: false,
            label: "bulk".to_string(),
        }
    }
}

/// Builder for [`BulkIndexConfig`].
#[derive(Debug, Default)]
pub struct BulkIndexConfigBuilder {
    flush_bytes: Option<usize>,
    aggregation: Option<bool>,
    label: Option<String>,
}

impl BulkIndexConfigBuilder {
    /// Sets the flush threshold in bytes.
    #[must_use]
    pub fn flush_bytes(mut self, bytes: usize) -> Self {
        self.flush_bytes = Some(bytes);
        self
    }

    /// Enables or disables per-key aggregation.
    #[must_use]
    pub fn aggregation(mut self, enabled: bool) -> Self {
        self.aggregation = Some(enabled);
        self
    }

    /// Sets the label used in logs and metrics.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush threshold is zero.
    pub fn build(self) -> Result<BulkIndexConfig, String> {
        let defaults = BulkIndexConfig::default();
        let flush_bytes = self.flush_bytes.unwrap_or(defaults.flush_bytes);
        if flush_bytes == 0 {
            return Err("flush_bytes must be greater than 0".to_string());
        }
        Ok(BulkIndexConfig {
            flush_bytes,
            aggregation: self.aggregation.unwrap_or(defaults.aggregation),
            label: self.label.unwrap_or(defaults.label),
        })
    }
}

#[derive(Debug, Default)]
struct BufferState {
    entries: HashMap<String, Vec<Vec<u8>>>,
    order: Vec<String>,
    total_bytes: usize,
}

impl BufferState {
    fn push(&mut self, key: String, encoded: Vec<u8>, aggregate: bool) {
        let added = encoded.len();
        match self.entries.get_mut(&key) {
            Some(pending) if aggregate && !pending.is_empty() => {
                if let Some(last) = pending.last_mut() {
                    self.total_bytes -= last.len();
                    *last = encoded;
                }
            }
            Some(pending) => pending.push(encoded),
            None => {
                self.order.push(key.clone());
                self.entries.insert(key, vec![encoded]);
            }
        }
        self.total_bytes += added;
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for key in &self.order {
            if let Some(pending) = self.entries.get(key) {
                for entry in pending {
                    out.extend_from_slice(entry);
                }
            }
        }
        out
    }

    fn operation_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}

/// Size-triggered bulk buffer in front of a [`BulkApi`].
pub struct BulkIndexBuffer {
    api: Arc<dyn BulkApi>,
    config: BulkIndexConfig,
    state: Mutex<BufferState>,
}

impl BulkIndexBuffer {
    /// Creates an empty buffer.
    pub fn new(api: Arc<dyn BulkApi>, config: BulkIndexConfig) -> Self {
        Self {
            api,
            config,
            state: Mutex::new(BufferState::default()),
        }
    }

    /// The buffer's configuration.
    #[must_use]
    pub fn config(&self) -> &BulkIndexConfig {
        &self.config
    }

    /// Queues one operation and flushes if the threshold is reached.
    ///
    /// # Errors
    ///
    /// - [`BulkError::Serialization`] if the item cannot be encoded; nothing
    ///   is queued.
    /// - [`BulkError::Flush`] if a triggered flush failed; the item stays
    ///   queued with everything else.
    pub async fn add(&self, item: BulkItem) -> Result<AddOutcome, BulkError> {
        let encoded = item.encode()?;
        let mut state = self.state.lock().await;
        state.push(item.key, encoded, self.config.aggregation);
        metrics::set_buffered_bytes(state.total_bytes, &self.config.label);

        if state.total_bytes < self.config.flush_bytes {
            return Ok(AddOutcome::Buffered);
        }

        self.flush_locked(&mut state).await?;
        Ok(AddOutcome::Flushed)
    }

    /// Flushes whatever is pending. Returns whether a request was sent.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Flush`] if the request failed; the buffer is
    /// kept.
    pub async fn flush(&self) -> Result<bool, BulkError> {
        let mut state = self.state.lock().await;
        if state.order.is_empty() {
            return Ok(false);
        }
        self.flush_locked(&mut state).await?;
        Ok(true)
    }

    /// Total bytes currently buffered.
    pub async fn buffered_bytes(&self) -> usize {
        self.state.lock().await.total_bytes
    }

    /// Number of pending operations across all keys.
    pub async fn pending_operations(&self) -> usize {
        self.state.lock().await.operation_count()
    }

    /// Returns true if nothing is waiting to be flushed.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.order.is_empty()
    }

    /// Number of pending operations for one key.
    pub async fn pending_for(&self, key: &str) -> usize {
        self.state
            .lock()
            .await
            .entries
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Spawns a task that flushes every `interval` until `cancel` fires.
    ///
    /// Flush failures are logged and retried on the next tick.
    pub fn spawn_periodic_flush(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(label = %buffer.config.label, "Periodic bulk flush stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush().await {
                            warn!(label = %buffer.config.label, error = %e, "Periodic bulk flush failed");
                        }
                    }
                }
            }
        })
    }

    async fn flush_locked(&self, state: &mut BufferState) -> Result<(), BulkError> {
        let payload = state.payload();
        let bytes = payload.len();
        let operations = state.operation_count();
        let started = Instant::now();

        if let Err(e) = self.api.bulk(payload).await {
            metrics::increment_bulk_flush_failures(&self.config.label);
            warn!(
                label = %self.config.label,
                bytes,
                operations,
                error = %e,
                "Bulk flush failed, keeping buffer"
            );
            return Err(e);
        }

        state.clear();
        metrics::record_bulk_flush(bytes, &self.config.label);
        metrics::set_buffered_bytes(0, &self.config.label);
        info!(
            label = %self.config.label,
            bytes,
            operations,
            elapsed_ms = started.elapsed().as_millis(),
            "Bulk flush completed"
        );
        Ok(())
    }
}

/// A [`BulkApi`] that records payloads, for tests and benchmarks.
#[derive(Debug, Default)]
pub struct RecordingBulkApi {
    payloads: std::sync::Mutex<Vec<Vec<u8>>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingBulkApi {
    /// Creates an API that accepts every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent requests fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Payloads accepted so far.
    #[must_use]
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BulkApi for RecordingBulkApi {
    async fn bulk(&self, payload: Vec<u8>) -> Result<(), BulkError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BulkError::flush_msg("bulk endpoint unavailable"));
        }
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer(api: &Arc<RecordingBulkApi>, flush_bytes: usize, aggregation: bool) -> BulkIndexBuffer {
        let config = BulkIndexConfig::builder()
            .flush_bytes(flush_bytes)
            .aggregation(aggregation)
            .build()
            .unwrap();
        BulkIndexBuffer::new(Arc::clone(api) as Arc<dyn BulkApi>, config)
    }

    #[test]
    fn encode_update_with_upsert() {
        let item = BulkItem::update("idx", "42", json!({"a": 1}), true);
        let text = String::from_utf8(item.encode().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let meta: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta, json!({"update": {"_index": "idx", "_id": "42"}}));
        let body: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(body, json!({"doc": {"a": 1}, "doc_as_upsert": true}));
    }

    #[test]
    fn encode_delete_has_no_body() {
        let item = BulkItem::delete("idx", "42");
        let text = String::from_utf8(item.encode().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn encode_create_omits_id() {
        let item = BulkItem::create("idx", "k", json!({"x": true}));
        let text = String::from_utf8(item.encode().unwrap()).unwrap();
        let meta: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(meta, json!({"create": {"_index": "idx"}}));
    }

    #[test]
    fn builder_rejects_zero_threshold() {
        assert!(BulkIndexConfig::builder().flush_bytes(0).build().is_err());
        let config = BulkIndexConfig::builder().build().unwrap();
        assert_eq!(config.flush_bytes, DEFAULT_FLUSH_BYTES);
        assert!(!config.aggregation);
    }

    #[tokio::test]
    async fn aggregation_replaces_last_entry() {
        let api = Arc::new(RecordingBulkApi::new());
        let buf = buffer(&api, 1 << 20, true);
        buf.add(BulkItem::update("i", "d1", json!({"v": 1}), true)).await.unwrap();
        let first = buf.buffered_bytes().await;
        buf.add(BulkItem::update("i", "d1", json!({"v": 2}), true)).await.unwrap();
        assert_eq!(buf.pending_for("d1").await, 1);
        assert_eq!(buf.buffered_bytes().await, first);
    }

    #[tokio::test]
    async fn no_aggregation_appends() {
        let api = Arc::new(RecordingBulkApi::new());
        let buf = buffer(&api, 1 << 20, false);
        buf.add(BulkItem::update("i", "d1", json!({"v": 1}), true)).await.unwrap();
        buf.add(BulkItem::update("i", "d1", json!({"v": 2}), true)).await.unwrap();
        assert_eq!(buf.pending_for("d1").await, 2);
    }

    #[tokio::test]
    async fn threshold_triggers_single_request_and_clears() {
        let api = Arc::new(RecordingBulkApi::new());
        let item = BulkItem::update("i", "d1", json!({"v": 1}), true);
        let size = item.encode().unwrap().len();
        let buf = buffer(&api, size * 2, false);

        assert_eq!(buf.add(item).await.unwrap(), AddOutcome::Buffered);
        let second = BulkItem::delete("i", "d2");
        assert_eq!(buf.add(second).await.unwrap(), AddOutcome::Buffered);
        let third = BulkItem::update("i", "d3", json!({"v": 3}), true);
        assert_eq!(buf.add(third).await.unwrap(), AddOutcome::Flushed);

        let payloads = api.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(String::from_utf8(payloads[0].clone()).unwrap().lines().count(), 5);
        assert_eq!(buf.buffered_bytes().await, 0);
        assert_eq!(buf.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_buffer() {
        let api = Arc::new(RecordingBulkApi::new());
        api.set_failing(true);
        let buf = buffer(&api, 1, false);

        let result = buf.add(BulkItem::delete("i", "d1")).await;
        assert!(matches!(result, Err(BulkError::Flush { .. })));
        assert_eq!(buf.pending_operations().await, 1);
        let kept = buf.buffered_bytes().await;
        assert!(kept > 0);
        assert!(!buf.is_empty().await);

        api.set_failing(false);
        assert!(buf.flush().await.unwrap());
        assert_eq!(buf.buffered_bytes().await, 0);
        assert!(buf.is_empty().await);
        assert_eq!(api.payloads().len(), 1);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let api = Arc::new(RecordingBulkApi::new());
        let buf = buffer(&api, 10, false);
        assert!(!buf.flush().await.unwrap());
        assert!(api.payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_drains_buffer() {
        let api = Arc::new(RecordingBulkApi::new());
        let buf = Arc::new(buffer(&api, 1 << 20, false));
        let cancel = CancellationToken::new();
        let handle = buf.spawn_periodic_flush(Duration::from_secs(5), cancel.clone());

        buf.add(BulkItem::delete("i", "d1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(api.payloads().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
