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

//! The OpenSearch [`SinkAdapter`].

use super::client::{DocumentApi, OpenSearchClient};
use super::config::{IndexMode, OpenSearchConfig};
use super::SINK_NAME;
use async_trait::async_trait;
use penne_core::bulk::{AddOutcome, BulkApi, BulkError, BulkIndexBuffer, BulkItem};
use penne_core::event::{ChangeEvent, OperationType};
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes change events to an OpenSearch index.
///
/// Unbuffered modes report [`Delivery::Delivered`] once the cluster
/// acknowledged the request. Bulk modes report [`Delivery::Buffered`] until
/// a flush that includes the event succeeds; a failed flush keeps the
/// buffer and is retried by the next flush, so the event stays
/// undelivered rather than failing the relay.
pub struct OpenSearchSink {
    config: OpenSearchConfig,
    documents: Arc<dyn DocumentApi>,
    buffer: Option<Arc<BulkIndexBuffer>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OpenSearchSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSearchSink")
            .field("config", &self.config)
            .field("bulk", &self.buffer.is_some())
            .finish_non_exhaustive()
    }
}

impl OpenSearchSink {
    /// Connects to the configured cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OpenSearchConfig) -> Result<Self, SinkError> {
        let client = Arc::new(OpenSearchClient::new(&config)?);
        info!(
            endpoint = %client.endpoint(),
            index = %config.index,
            mode = config.mode.as_str(),
            "OpenSearch sink initialized"
        );
        Ok(Self::with_clients(
            config,
            Arc::clone(&client) as Arc<dyn DocumentApi>,
            client as Arc<dyn BulkApi>,
        ))
    }

    /// Builds a sink on top of explicit clients.
    ///
    /// Spawns the periodic flush task when a flush interval is configured in
    /// a bulk mode, so it must be called inside a Tokio runtime.
    pub fn with_clients(
        config: OpenSearchConfig,
        documents: Arc<dyn DocumentApi>,
        bulk: Arc<dyn BulkApi>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let buffer = config
            .mode
            .is_bulk()
            .then(|| Arc::new(BulkIndexBuffer::new(bulk, config.bulk.clone())));
        let flush_task = match (&buffer, config.flush_interval) {
            (Some(buffer), Some(interval)) => {
                debug!(interval_ms = interval.as_millis(), "Starting periodic bulk flush");
                Some(buffer.spawn_periodic_flush(interval, cancel.child_token()))
            }
            _ => None,
        };

        Self {
            config,
            documents,
            buffer,
            flush_task: Mutex::new(flush_task),
            cancel,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OpenSearchConfig {
        &self.config
    }

    /// Returns the bulk buffer in bulk modes.
    pub fn buffer(&self) -> Option<&Arc<BulkIndexBuffer>> {
        self.buffer.as_ref()
    }

    async fn record(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let body = strip_id(event.to_json());
        self.documents.index(&self.config.index, None, &body).await?;
        Ok(Delivery::Delivered)
    }

    async fn sync(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        if !event.operation.is_document_level() {
            return Ok(skip(event, "not a document write"));
        }
        let id = document_id(event)?;
        let index = &self.config.index;
        match &event.operation {
            OperationType::Insert => {
                let Some(doc) = full_document(event) else {
                    return Ok(skip(event, "insert without fullDocument"));
                };
                self.documents.index(index, Some(&id), &doc).await?;
            }
            OperationType::Update | OperationType::Replace => {
                let Some(doc) = full_document(event) else {
                    return Ok(skip(event, "document no longer exists"));
                };
                self.documents.update(index, &id, &doc).await?;
            }
            _ => self.documents.delete(index, &id).await?,
        }
        Ok(Delivery::Delivered)
    }

    async fn buffered(&self, buffer: &BulkIndexBuffer, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let Some(item) = self.bulk_item(event)? else {
            // Earlier operations may still be pending; the checkpoint must not pass them.
            if buffer.is_empty().await {
                return Ok(Delivery::Delivered);
            }
            return Ok(Delivery::Buffered);
        };

        match buffer.add(item).await {
            Ok(AddOutcome::Flushed) => Ok(Delivery::Delivered),
            Ok(AddOutcome::Buffered) => Ok(Delivery::Buffered),
            Err(BulkError::Serialization(e)) => {
                Err(SinkError::serialization(e, "failed to encode bulk operation"))
            }
            Err(e @ BulkError::Flush { .. }) => {
                warn!(
                    sink = SINK_NAME,
                    checkpoint = event.checkpoint(),
                    error = %e,
                    "Bulk flush failed, event stays buffered"
                );
                Ok(Delivery::Buffered)
            }
        }
    }

    fn bulk_item(&self, event: &ChangeEvent) -> Result<Option<BulkItem>, SinkError> {
        let index = &self.config.index;
        if self.config.mode == IndexMode::BulkRecord {
            if !event.operation.is_document_level() {
                skip(event, "not a document write");
                return Ok(None);
            }
            let key = document_id(event)?;
            return Ok(Some(BulkItem::create(index, key, strip_id(event.to_json()))));
        }

        let item = match &event.operation {
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                let id = document_id(event)?;
                let Some(doc) = full_document(event) else {
                    skip(event, "document no longer exists");
                    return Ok(None);
                };
                BulkItem::update(index, id, doc, true)
            }
            OperationType::Delete => BulkItem::delete(index, document_id(event)?),
            _ => {
                skip(event, "not a document write");
                return Ok(None);
            }
        };
        Ok(Some(item))
    }
}

#[async_trait]
impl SinkAdapter for OpenSearchSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        match (&self.buffer, self.config.mode) {
            (Some(buffer), _) => self.buffered(buffer, event).await,
            (None, IndexMode::Sync) => self.sync(event).await,
            (None, _) => self.record(event).await,
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.cancel.cancel();
        if let Some(handle) = self.flush_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Periodic bulk flush task ended abnormally");
            }
        }

        let Some(buffer) = &self.buffer else {
            return Ok(());
        };
        let pending = buffer.pending_operations().await;
        match buffer.flush().await {
            Ok(_) => {
                info!(operations = pending, "OpenSearch sink closed");
                Ok(())
            }
            Err(e) => Err(SinkError::write_msg(
                format!("final bulk flush of {pending} operations failed: {e}"),
                true,
            )),
        }
    }
}

impl Drop for OpenSearchSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn document_id(event: &ChangeEvent) -> Result<String, SinkError> {
    event.document_id_string().ok_or_else(|| {
        SinkError::write_msg(
            format!(
                "{} event {} has no documentKey._id",
                event.operation,
                event.checkpoint()
            ),
            false,
        )
    })
}

fn full_document(event: &ChangeEvent) -> Option<Value> {
    event
        .full_document
        .as_ref()
        .map(|doc| strip_id(bson::Bson::Document(doc.clone()).into_relaxed_extjson()))
}

/// `_id` is a metadata field and cannot appear in a document source.
fn strip_id(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove("_id");
    }
    value
}

fn skip(event: &ChangeEvent, reason: &str) -> Delivery {
    debug!(
        sink = SINK_NAME,
        operation = %event.operation,
        checkpoint = event.checkpoint(),
        reason,
        "Skipping event"
    );
    Delivery::Delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use penne_core::bulk::RecordingBulkApi;
    use penne_core::event::Namespace;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Index(Option<String>, Value),
        Update(String, Value),
        Delete(String),
    }

    #[derive(Default)]
    struct RecordingDocuments {
        calls: StdMutex<Vec<Call>>,
    }

    impl RecordingDocuments {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentApi for RecordingDocuments {
        async fn index(&self, _index: &str, id: Option<&str>, body: &Value) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(Call::Index(id.map(str::to_string), body.clone()));
            Ok(())
        }

        async fn update(&self, _index: &str, id: &str, doc: &Value) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(Call::Update(id.to_string(), doc.clone()));
            Ok(())
        }

        async fn delete(&self, _index: &str, id: &str) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(Call::Delete(id.to_string()));
            Ok(())
        }
    }

    fn config(sync: bool, bulk: bool, flush_bytes: usize) -> OpenSearchConfig {
        OpenSearchConfig::builder()
            .endpoint("http://localhost:9200")
            .index("orders")
            .sync(sync)
            .bulk(bulk)
            .flush_bytes(flush_bytes)
            .build()
            .unwrap()
    }

    fn sink(
        config: OpenSearchConfig,
    ) -> (OpenSearchSink, Arc<RecordingDocuments>, Arc<RecordingBulkApi>) {
        let documents = Arc::new(RecordingDocuments::default());
        let bulk = Arc::new(RecordingBulkApi::new());
        let sink = OpenSearchSink::with_clients(
            config,
            Arc::clone(&documents) as Arc<dyn DocumentApi>,
            Arc::clone(&bulk) as Arc<dyn BulkApi>,
        );
        (sink, documents, bulk)
    }

    fn event(token: &str, op: OperationType, id: &str) -> ChangeEvent {
        let mut event = ChangeEvent::new(token, op.clone(), Namespace::new("shop", "orders"))
            .with_document_key(doc! { "_id": id });
        if op != OperationType::Delete {
            event = event.with_full_document(doc! { "_id": id, "qty": 1 });
        }
        event
    }

    fn lines(payload: &[u8]) -> Vec<Value> {
        payload
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn record_mode_indexes_whole_event() {
        let (sink, documents, _) = sink(config(false, false, 0));
        let delivery = sink.deliver(&event("t1", OperationType::Insert, "a")).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);

        let calls = documents.calls();
        let Call::Index(None, body) = &calls[0] else {
            panic!("unexpected call {calls:?}");
        };
        assert_eq!(body["operationType"], "insert");
        assert_eq!(body["fullDocument"]["qty"], 1);
        assert!(body.get("_id").is_none());
    }

    #[tokio::test]
    async fn sync_mode_maps_operations() {
        let (sink, documents, _) = sink(config(true, false, 0));
        for (token, op) in [
            ("t1", OperationType::Insert),
            ("t2", OperationType::Update),
            ("t3", OperationType::Replace),
            ("t4", OperationType::Delete),
        ] {
            let delivery = sink.deliver(&event(token, op, "a")).await.unwrap();
            assert_eq!(delivery, Delivery::Delivered);
        }
        let invalidate =
            ChangeEvent::new("t5", OperationType::Invalidate, Namespace::new("shop", "orders"));
        assert_eq!(sink.deliver(&invalidate).await.unwrap(), Delivery::Delivered);

        let doc = serde_json::json!({ "qty": 1 });
        assert_eq!(
            documents.calls(),
            vec![
                Call::Index(Some("a".to_string()), doc.clone()),
                Call::Update("a".to_string(), doc.clone()),
                Call::Update("a".to_string(), doc),
                Call::Delete("a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn sync_update_without_full_document_is_skipped() {
        let (sink, documents, _) = sink(config(true, false, 0));
        let event = ChangeEvent::new("t1", OperationType::Update, Namespace::new("shop", "orders"))
            .with_document_key(doc! { "_id": "a" });
        assert_eq!(sink.deliver(&event).await.unwrap(), Delivery::Delivered);
        assert!(documents.calls().is_empty());
    }

    #[tokio::test]
    async fn bulk_sync_buffers_until_threshold() {
        let (sink, _, bulk) = sink(config(true, true, 1_000_000));
        let delivery = sink.deliver(&event("t1", OperationType::Insert, "a")).await.unwrap();
        assert_eq!(delivery, Delivery::Buffered);
        assert!(bulk.payloads().is_empty());

        sink.close().await.unwrap();
        let payloads = bulk.payloads();
        assert_eq!(payloads.len(), 1);
        let lines = lines(&payloads[0]);
        assert_eq!(lines[0]["update"]["_id"], "a");
        assert_eq!(lines[1]["doc"]["qty"], 1);
        assert_eq!(lines[1]["doc_as_upsert"], true);
    }

    #[tokio::test]
    async fn bulk_flush_marks_event_delivered() {
        let (sink, _, bulk) = sink(config(true, true, 1));
        let delivery = sink.deliver(&event("t1", OperationType::Delete, "a")).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);

        let lines = lines(&bulk.payloads()[0]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["delete"]["_index"], "orders");
    }

    #[tokio::test]
    async fn failed_flush_keeps_event_buffered() {
        let (sink, _, bulk) = sink(config(false, true, 1));
        bulk.set_failing(true);

        let delivery = sink.deliver(&event("t1", OperationType::Insert, "a")).await.unwrap();
        assert_eq!(delivery, Delivery::Buffered);
        let buffer = sink.buffer().unwrap();
        assert_eq!(buffer.pending_operations().await, 1);

        bulk.set_failing(false);
        let delivery = sink.deliver(&event("t2", OperationType::Insert, "b")).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        let lines = lines(&bulk.payloads()[0]);
        assert_eq!(lines.len(), 4);
        assert!(lines[0]["create"].get("_id").is_none());
        assert_eq!(lines[1]["ns"]["coll"], "orders");
    }

    #[tokio::test]
    async fn close_surfaces_final_flush_failure() {
        let (sink, _, bulk) = sink(config(true, true, 1_000_000));
        sink.deliver(&event("t1", OperationType::Insert, "a")).await.unwrap();
        bulk.set_failing(true);
        assert!(sink.close().await.is_err());
    }

    #[tokio::test]
    async fn skipped_event_stays_buffered_behind_pending_writes() {
        let (sink, _, bulk) = sink(config(true, true, 1_000_000));
        let drop = ChangeEvent::new("t0", OperationType::Drop, Namespace::new("shop", "orders"));
        assert_eq!(sink.deliver(&drop).await.unwrap(), Delivery::Delivered);

        assert_eq!(
            sink.deliver(&event("t1", OperationType::Insert, "a")).await.unwrap(),
            Delivery::Buffered
        );
        let gone = ChangeEvent::new("t2", OperationType::Update, Namespace::new("shop", "orders"))
            .with_document_key(doc! { "_id": "b" });
        assert_eq!(sink.deliver(&gone).await.unwrap(), Delivery::Buffered);
        let drop = ChangeEvent::new("t3", OperationType::Drop, Namespace::new("shop", "orders"));
        assert_eq!(sink.deliver(&drop).await.unwrap(), Delivery::Buffered);
        assert!(bulk.payloads().is_empty());

        sink.buffer().unwrap().flush().await.unwrap();
        let drop = ChangeEvent::new("t4", OperationType::Drop, Namespace::new("shop", "orders"));
        assert_eq!(sink.deliver(&drop).await.unwrap(), Delivery::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flush_drains_buffer() {
        let config = OpenSearchConfig {
            flush_interval: Some(Duration::from_secs(5)),
            ..config(true, true, 1_000_000)
        };
        let (sink, _, bulk) = sink(config);
        sink.deliver(&event("t1", OperationType::Update, "a")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(bulk.payloads().len(), 1);
        sink.close().await.unwrap();
        assert_eq!(bulk.payloads().len(), 1);
    }
}
