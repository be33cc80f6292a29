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

//! Sinks behind the fan-out dispatcher: a buffering OpenSearch sink holds
//! the checkpoint back until its bulk buffer is flushed.

use async_trait::async_trait;
use bson::doc;
use penne_core::bulk::{BulkApi, RecordingBulkApi};
use penne_core::dispatcher::FanoutDispatcher;
use penne_core::event::{ChangeEvent, Namespace, OperationType};
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use penne_sinks::file::{FileSink, FileSinkConfig};
use penne_sinks::opensearch::{DocumentApi, OpenSearchConfig, OpenSearchSink};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct NoDocuments;

#[async_trait]
impl DocumentApi for NoDocuments {
    async fn index(&self, _index: &str, _id: Option<&str>, _body: &Value) -> Result<(), SinkError> {
        Err(SinkError::write_msg("unexpected single document call", false))
    }

    async fn update(&self, _index: &str, _id: &str, _doc: &Value) -> Result<(), SinkError> {
        Err(SinkError::write_msg("unexpected single document call", false))
    }

    async fn delete(&self, _index: &str, _id: &str) -> Result<(), SinkError> {
        Err(SinkError::write_msg("unexpected single document call", false))
    }
}

fn insert(token: &str, id: &str) -> Arc<ChangeEvent> {
    Arc::new(
        ChangeEvent::new(token, OperationType::Insert, Namespace::new("shop", "orders"))
            .with_document_key(doc! { "_id": id })
            .with_full_document(doc! { "_id": id, "payload": "x".repeat(64) }),
    )
}

#[tokio::test]
async fn buffered_search_sink_holds_back_checkpoint_until_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("changestream.log");
    let file = Arc::new(FileSink::open(&path, FileSinkConfig::default()).await.unwrap());

    let bulk = Arc::new(RecordingBulkApi::new());
    let config = OpenSearchConfig::builder()
        .endpoint("http://localhost:9200")
        .index("orders")
        .sync(true)
        .bulk(true)
        .flush_bytes(400)
        .build()
        .unwrap();
    let search = Arc::new(OpenSearchSink::with_clients(
        config,
        Arc::new(NoDocuments),
        Arc::clone(&bulk) as Arc<dyn BulkApi>,
    ));

    let dispatcher = FanoutDispatcher::new(vec![
        file as Arc<dyn SinkAdapter>,
        Arc::clone(&search) as Arc<dyn SinkAdapter>,
    ]);
    let cancel = CancellationToken::new();

    let first = dispatcher.dispatch(&insert("t1", "a"), &cancel).await.unwrap();
    assert!(!first.is_checkpointable());
    assert_eq!(first.buffered_sinks(), vec!["opensearch"]);

    let mut flushed_at = None;
    for (i, token) in ["t2", "t3", "t4", "t5"].iter().enumerate() {
        let outcome = dispatcher
            .dispatch(&insert(token, &format!("d{i}")), &cancel)
            .await
            .unwrap();
        if outcome.is_checkpointable() {
            flushed_at = Some(*token);
            break;
        }
    }
    assert!(flushed_at.is_some(), "bulk buffer never reached its threshold");
    assert_eq!(bulk.payloads().len(), 1);

    dispatcher.close().await.unwrap();
    let lines = tokio::fs::read_to_string(&path).await.unwrap().lines().count();
    assert!(lines >= 2);
}

#[tokio::test]
async fn file_sink_alone_is_always_checkpointable() {
    let dir = tempfile::tempdir().unwrap();
    let file = FileSink::open(dir.path().join("cs.log"), FileSinkConfig::default())
        .await
        .unwrap();
    let dispatcher = FanoutDispatcher::new(vec![Arc::new(file) as Arc<dyn SinkAdapter>]);

    let outcome = dispatcher
        .dispatch(&insert("t1", "a"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_checkpointable());
    assert_eq!(outcome.deliveries(), &[("file".to_string(), Delivery::Delivered)]);
}
