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

//! BigQuery streaming-insert sink.
//!
//! Each event becomes one row of a table with the columns `id`,
//! `operationType`, `clusterTime`, `fullDocument`, `ns`, `documentKey` and
//! `updateDescription`. The resume token is used as the insert id, so a
//! replay after restart is deduplicated by BigQuery on a best-effort basis.

use crate::record::ChangeRecord;
use async_trait::async_trait;
use chrono::SecondsFormat;
use chrono_tz::Tz;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::model::table_data_insert_all_request_rows::TableDataInsertAllRequestRows;
use gcp_bigquery_client::Client;
use penne_core::event::ChangeEvent;
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, trace};

/// Registry name of this sink.
pub const SINK_NAME: &str = "bigquery";

/// Configuration for [`BigQuerySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigQueryConfig {
    /// GCP project owning the dataset
    pub project_id: String,
    /// Dataset id
    pub dataset: String,
    /// Table id
    pub table: String,
    /// Zone for the cluster time column
    pub time_zone: Tz,
}

impl BigQueryConfig {
    fn validate(&self) -> Result<(), SinkError> {
        for (value, parameter) in [
            (&self.project_id, "PROJECT_NAME_TO_EXPORT_CHANGE_STREAMS"),
            (&self.dataset, "BIGQUERY_DATASET"),
            (&self.table, "BIGQUERY_TABLE"),
        ] {
            if value.trim().is_empty() {
                return Err(SinkError::configuration(
                    format!("{parameter} is required for the BigQuery sink"),
                    Some(parameter.to_string()),
                ));
            }
        }
        Ok(())
    }
}

/// Renders the table row for one record.
pub fn table_row(record: &ChangeRecord) -> Value {
    json!({
        "id": record.id,
        "operationType": record.operation_type,
        "clusterTime": record.cluster_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        "fullDocument": record.full_document,
        "ns": record.ns,
        "documentKey": record.document_key,
        "updateDescription": record.update_description,
    })
}

/// The streaming insert call the sink makes.
#[async_trait]
pub trait InsertRowsApi: Send + Sync {
    /// Inserts one row into `dataset.table`.
    async fn insert_row(&self, dataset: &str, table: &str, insert_id: &str, row: Value) -> Result<(), SinkError>;
}

/// [`InsertRowsApi`] over the BigQuery REST client.
pub struct TableDataClient {
    client: Client,
    project_id: String,
}

#[async_trait]
impl InsertRowsApi for TableDataClient {
    async fn insert_row(&self, dataset: &str, table: &str, insert_id: &str, row: Value) -> Result<(), SinkError> {
        let mut request = TableDataInsertAllRequest::new();
        request
            .add_rows(vec![TableDataInsertAllRequestRows {
                insert_id: Some(insert_id.to_string()),
                json: row,
            }])
            .map_err(|e| SinkError::serialization(e, "failed to add BigQuery row"))?;

        let response = self
            .client
            .tabledata()
            .insert_all(&self.project_id, dataset, table, request)
            .await
            .map_err(|e| SinkError::write_msg(format!("BigQuery insert failed: {e}"), true))?;

        if let Some(errors) = response.insert_errors.filter(|errors| !errors.is_empty()) {
            return Err(SinkError::write_msg(
                format!("BigQuery rejected row: {:?}", errors[0].errors),
                false,
            ));
        }
        Ok(())
    }
}

/// Streams one BigQuery row per event.
pub struct BigQuerySink {
    config: BigQueryConfig,
    api: Arc<dyn InsertRowsApi>,
}

impl std::fmt::Debug for BigQuerySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQuerySink").field("config", &self.config).finish_non_exhaustive()
    }
}

impl BigQuerySink {
    /// Connects with Application Default Credentials.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if project, dataset or table is empty,
    /// or a connection error if the client cannot authenticate.
    pub async fn new(config: BigQueryConfig) -> Result<Self, SinkError> {
        config.validate()?;
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| SinkError::connection_msg(format!("BigQuery client failed: {e}")))?;
        info!(
            project = %config.project_id,
            dataset = %config.dataset,
            table = %config.table,
            "BigQuery sink initialized"
        );
        let api = TableDataClient {
            client,
            project_id: config.project_id.clone(),
        };
        Ok(Self::with_api(config, Arc::new(api)))
    }

    /// Builds a sink on top of an explicit client.
    pub fn with_api(config: BigQueryConfig, api: Arc<dyn InsertRowsApi>) -> Self {
        Self { config, api }
    }
}

#[async_trait]
impl SinkAdapter for BigQuerySink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let record = ChangeRecord::from_event(event, self.config.time_zone);
        self.api
            .insert_row(&self.config.dataset, &self.config.table, event.checkpoint(), table_row(&record))
            .await?;
        trace!(table = %self.config.table, "Inserted change row");
        Ok(Delivery::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use penne_core::event::{Namespace, OperationType};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingInserts {
        rows: Mutex<Vec<(String, String, String, Value)>>,
    }

    #[async_trait]
    impl InsertRowsApi for RecordingInserts {
        async fn insert_row(&self, dataset: &str, table: &str, insert_id: &str, row: Value) -> Result<(), SinkError> {
            self.rows.lock().unwrap().push((
                dataset.to_string(),
                table.to_string(),
                insert_id.to_string(),
                row,
            ));
            Ok(())
        }
    }

    fn config(zone: Tz) -> BigQueryConfig {
        BigQueryConfig {
            project_id: "proj".to_string(),
            dataset: "cdc".to_string(),
            table: "orders".to_string(),
            time_zone: zone,
        }
    }

    #[test]
    fn missing_dataset_is_rejected() {
        let mut config = config(Tz::UTC);
        config.dataset = String::new();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn inserts_row_keyed_by_resume_token() {
        let api = Arc::new(RecordingInserts::default());
        let sink = BigQuerySink::with_api(config(Tz::Asia__Tokyo), Arc::clone(&api) as Arc<dyn InsertRowsApi>);
        let event = ChangeEvent::new("00000", OperationType::Insert, Namespace::new("shop", "orders"))
            .with_cluster_time(1_700_000_000, 1)
            .with_full_document(doc! { "sku": "A-1" });

        assert_eq!(sink.deliver(&event).await.unwrap(), Delivery::Delivered);

        let rows = api.rows.lock().unwrap();
        let (dataset, table, insert_id, row) = &rows[0];
        assert_eq!((dataset.as_str(), table.as_str(), insert_id.as_str()), ("cdc", "orders", "00000"));
        assert_eq!(row["id"], r#"{"_data":"00000"}"#);
        assert_eq!(row["operationType"], "insert");
        assert_eq!(row["clusterTime"], "2023-11-15T07:13:20+09:00");
        assert_eq!(row["fullDocument"], r#"{"sku":"A-1"}"#);
        assert_eq!(row["updateDescription"], "null");
    }
}
