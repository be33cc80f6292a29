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

//! Elasticsearch sink.
//!
//! Talks to the cluster through the same document REST client as the
//! OpenSearch sink. Two modes:
//!
//! - **record** (default): each event becomes one [`ChangeStreamDocument`]
//!   indexed under a cluster-assigned id.
//! - **sync**: the index mirrors the collection. Inserts, updates and
//!   replaces index the full document under its `_id`; deletes remove it.

use crate::opensearch::{DocumentApi, OpenSearchClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use penne_core::event::{ChangeEvent, OperationType};
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Registry name of this sink.
pub const SINK_NAME: &str = "elasticsearch";

/// Settings for [`ElasticsearchSink`].
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Base URL of the cluster
    pub endpoint: String,
    /// Target index
    pub index: String,
    /// Mirror documents instead of recording events
    pub sync: bool,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl ElasticsearchConfig {
    /// Validates and normalizes the settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing or malformed setting.
    pub fn new(endpoint: &str, index: &str, sync: bool) -> Result<Self, String> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err("ELASTICSEARCH_HOST is required".to_string());
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(format!("ELASTICSEARCH_HOST must be an http(s) URL, got {endpoint}"));
        }
        let index = index.trim();
        if index.is_empty() {
            return Err("ELASTICSEARCH_INDEX_NAME is required".to_string());
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            index: index.to_string(),
            sync,
            request_timeout: Duration::from_secs(30),
        })
    }
}

/// Document written per event in record mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeStreamDocument {
    /// Resume token `_data`
    #[serde(rename = "ID")]
    pub id: String,
    /// Operation name
    pub operation_type: String,
    /// Commit time
    pub cluster_time: DateTime<Utc>,
    /// Post-image, if any
    pub full_document: Value,
    /// Namespace
    pub ns: Value,
    /// Document key, if any
    pub document_key: Value,
    /// Update delta, if any
    pub update_description: Value,
}

impl ChangeStreamDocument {
    /// Builds the record for `event`. Absent fields are `null`.
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            id: event.checkpoint().to_string(),
            operation_type: event.operation.as_str().to_string(),
            cluster_time: event.cluster_datetime(),
            full_document: event.field_json("fullDocument"),
            ns: event.field_json("ns"),
            document_key: event.field_json("documentKey"),
            update_description: event.field_json("updateDescription"),
        }
    }
}

/// Writes change events to an Elasticsearch index.
pub struct ElasticsearchSink {
    config: ElasticsearchConfig,
    documents: Arc<dyn DocumentApi>,
}

impl ElasticsearchSink {
    /// Creates a sink with an HTTP client for `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unusable endpoint.
    pub fn new(config: ElasticsearchConfig) -> Result<Self, SinkError> {
        let client = OpenSearchClient::connect(&config.endpoint, config.request_timeout)?;
        info!(
            endpoint = %config.endpoint,
            index = %config.index,
            sync = config.sync,
            "Elasticsearch sink ready"
        );
        Ok(Self::with_api(config, Arc::new(client)))
    }

    /// Creates a sink over an existing document client.
    pub fn with_api(config: ElasticsearchConfig, documents: Arc<dyn DocumentApi>) -> Self {
        Self { config, documents }
    }

    /// The sink's settings.
    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    async fn sync(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        if !event.operation.is_document_level() {
            return Ok(skip(event, "not a document write"));
        }
        let id = event.document_id_string().ok_or_else(|| {
            SinkError::write_msg(
                format!("{} event {} has no documentKey._id", event.operation, event.checkpoint()),
                false,
            )
        })?;

        if event.operation == OperationType::Delete {
            self.documents.delete(&self.config.index, &id).await?;
            return Ok(Delivery::Delivered);
        }

        if event.full_document.is_none() {
            return Ok(skip(event, "document no longer exists"));
        }
        let mut doc = event.field_json("fullDocument");
        if let Value::Object(map) = &mut doc {
            map.remove("_id");
        }
        self.documents.index(&self.config.index, Some(&id), &doc).await?;
        Ok(Delivery::Delivered)
    }

    async fn record(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let body = serde_json::to_value(ChangeStreamDocument::from_event(event))
            .map_err(|e| SinkError::serialization(e, "failed to encode change stream document"))?;
        self.documents.index(&self.config.index, None, &body).await?;
        Ok(Delivery::Delivered)
    }
}

#[async_trait]
impl SinkAdapter for ElasticsearchSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        if self.config.sync {
            self.sync(event).await
        } else {
            self.record(event).await
        }
    }
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
    use bson::{doc, oid::ObjectId};
    use penne_core::event::Namespace;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Index(Option<String>, Value),
        Delete(String),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Call>>);

    #[async_trait]
    impl DocumentApi for Recorder {
        async fn index(&self, _index: &str, id: Option<&str>, body: &Value) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(Call::Index(id.map(str::to_string), body.clone()));
            Ok(())
        }

        async fn update(&self, _index: &str, _id: &str, _doc: &Value) -> Result<(), SinkError> {
            unreachable!("the Elasticsearch sink never sends partial updates")
        }

        async fn delete(&self, _index: &str, id: &str) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(Call::Delete(id.to_string()));
            Ok(())
        }
    }

    fn sink(sync: bool) -> (ElasticsearchSink, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = ElasticsearchConfig::new("http://localhost:9200/", "orders", sync).unwrap();
        let sink = ElasticsearchSink::with_api(config, Arc::clone(&recorder) as Arc<dyn DocumentApi>);
        (sink, recorder)
    }

    #[test]
    fn config_validation() {
        let config = ElasticsearchConfig::new(" https://es:9200/ ", "orders", false).unwrap();
        assert_eq!(config.endpoint, "https://es:9200");
        assert!(ElasticsearchConfig::new("", "orders", false).is_err());
        assert!(ElasticsearchConfig::new("es:9200", "orders", false).is_err());
        assert!(ElasticsearchConfig::new("http://es:9200", " ", false).is_err());
    }

    #[tokio::test]
    async fn sync_upserts_by_object_id_and_deletes() {
        let (sink, recorder) = sink(true);
        let oid = ObjectId::parse_str("65a1b2c3d4e5f60718293a4b").unwrap();
        let ns = Namespace::new("shop", "orders");

        let insert = ChangeEvent::new("t1", OperationType::Insert, ns.clone())
            .with_document_key(doc! { "_id": oid })
            .with_full_document(doc! { "_id": oid, "qty": 2 });
        let delete = ChangeEvent::new("t2", OperationType::Delete, ns.clone())
            .with_document_key(doc! { "_id": oid });
        let drop = ChangeEvent::new("t3", OperationType::Drop, ns);

        for event in [insert, delete, drop] {
            assert_eq!(sink.deliver(&event).await.unwrap(), Delivery::Delivered);
        }

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                Call::Index(Some(oid.to_hex()), serde_json::json!({ "qty": 2 })),
                Call::Delete(oid.to_hex()),
            ]
        );
    }

    #[tokio::test]
    async fn record_mode_writes_change_stream_document() {
        let (sink, recorder) = sink(false);
        let event = ChangeEvent::new("826A01", OperationType::Insert, Namespace::new("shop", "orders"))
            .with_cluster_time(1_700_000_000, 1)
            .with_document_key(doc! { "_id": "a" })
            .with_full_document(doc! { "_id": "a", "qty": 1 });

        sink.deliver(&event).await.unwrap();

        let calls = recorder.0.lock().unwrap().clone();
        let [Call::Index(None, body)] = calls.as_slice() else {
            panic!("unexpected calls {calls:?}");
        };
        assert_eq!(body["ID"], "826A01");
        assert_eq!(body["OperationType"], "insert");
        assert_eq!(body["ClusterTime"], "2023-11-14T22:13:20Z");
        assert_eq!(body["FullDocument"]["qty"], 1);
        assert_eq!(body["Ns"]["coll"], "orders");
        assert_eq!(body["DocumentKey"]["_id"], "a");
        assert!(body["UpdateDescription"].is_null());
    }
}
