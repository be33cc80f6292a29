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

//! Process configuration.
//!
//! Every option is read from an environment variable and can also be given
//! as a long flag, so container deployments and local runs share one
//! surface.

use clap::{ArgAction, Args, Parser};
use std::time::Duration;

/// Configuration of the `penne` relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "penne")]
#[command(about = "Relays a MongoDB change stream to downstream sinks")]
#[command(version)]
pub struct RelayConfig {
    #[command(flatten)]
    pub mongo: MongoArgs,

    #[command(flatten)]
    pub namespace: NamespaceArgs,

    #[command(flatten)]
    pub checkpoint: CheckpointArgs,

    #[command(flatten)]
    pub sinks: SinkArgs,

    #[command(flatten)]
    pub opensearch: OpenSearchArgs,

    #[command(flatten)]
    pub elasticsearch: ElasticsearchArgs,

    #[command(flatten)]
    pub file: FileExporterArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

/// Configuration of the `penne-health` liveness check.
#[derive(Parser, Debug, Clone)]
#[command(name = "penne-health")]
#[command(about = "Pings the primary of the relay's MongoDB deployment")]
#[command(version)]
pub struct HealthConfig {
    #[command(flatten)]
    pub mongo: MongoArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

/// MongoDB connection.
#[derive(Args, Debug, Clone)]
pub struct MongoArgs {
    /// Connection string
    #[arg(long = "mongodb-host", env = "MONGODB_HOST")]
    pub host: String,
}

/// Watched namespace and change stream shaping.
#[derive(Args, Debug, Clone)]
pub struct NamespaceArgs {
    /// Database to watch
    #[arg(long = "mongodb-database", env = "MONGODB_DATABASE")]
    pub database: String,

    /// Collection to watch
    #[arg(long = "mongodb-collection", env = "MONGODB_COLLECTION")]
    pub collection: String,

    /// Comma-separated `fullDocument` field paths to drop from every event
    #[arg(
        long = "exclude-full-document-fields",
        env = "MONGO_WATCH_PIPELINE_EXCLUDE_CS_FULLDOCUMENT_FIELD",
        default_value = ""
    )]
    pub exclude_full_document_fields: String,
}

/// Checkpoint storage.
#[derive(Args, Debug, Clone)]
pub struct CheckpointArgs {
    /// Directory (or key prefix) holding the checkpoint
    #[arg(long = "resume-token-volume-dir", env = "RESUME_TOKEN_VOLUME_DIR", default_value = "")]
    pub volume_dir: String,

    /// Backend: `file`, `s3` or `gcs`; empty means `file`
    #[arg(long = "resume-token-volume-type", env = "RESUME_TOKEN_VOLUME_TYPE", default_value = "")]
    pub volume_type: String,

    /// Bucket for the object store backends
    #[arg(long = "resume-token-volume-bucket-name", env = "RESUME_TOKEN_VOLUME_BUCKET_NAME")]
    pub bucket_name: Option<String>,

    /// Checkpoint file name; defaults to `<collection>.dat`
    #[arg(long = "resume-token-file-name", env = "RESUME_TOKEN_FILE_NAME")]
    pub file_name: Option<String>,

    /// Region of the S3 bucket
    #[arg(long = "resume-token-bucket-region", env = "RESUME_TOKEN_BUCKET_REGION")]
    pub bucket_region: Option<String>,

    /// Minimum seconds between checkpoint writes; 0 writes after every event
    #[arg(
        long = "resume-token-save-interval-sec",
        env = "RESUME_TOKEN_SAVE_INTERVAL_SEC",
        default_value_t = 0
    )]
    pub save_interval_sec: u64,
}

impl CheckpointArgs {
    /// The save interval as a duration.
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_sec)
    }
}

/// Sink selection and the settings shared by the cloud sinks.
#[derive(Args, Debug, Clone)]
pub struct SinkArgs {
    /// Comma-separated sink names
    #[arg(long = "export-destination", env = "EXPORT_DESTINATION")]
    pub export_destination: String,

    /// GCP project for the Pub/Sub and BigQuery sinks
    #[arg(long = "project", env = "PROJECT_NAME_TO_EXPORT_CHANGE_STREAMS")]
    pub project: Option<String>,

    /// IANA zone for record timestamps; empty means UTC
    #[arg(long = "time-zone", env = "TIME_ZONE", default_value = "")]
    pub time_zone: String,

    /// BigQuery dataset
    #[arg(long = "bigquery-dataset", env = "BIGQUERY_DATASET")]
    pub bigquery_dataset: Option<String>,

    /// BigQuery table
    #[arg(long = "bigquery-table", env = "BIGQUERY_TABLE")]
    pub bigquery_table: Option<String>,

    /// Pub/Sub topic; defaults to the database name
    #[arg(long = "pubsub-topic-name", env = "PUBSUB_TOPIC_NAME")]
    pub pubsub_topic: Option<String>,

    /// Pub/Sub subscription; defaults to the collection name
    #[arg(long = "pubsub-subscription-name", env = "PUBSUB_SUBSCRIPTION_NAME")]
    pub pubsub_subscription: Option<String>,

    /// Kinesis stream name
    #[arg(long = "kinesis-stream-name", env = "KINESIS_STREAM_NAME")]
    pub kinesis_stream_name: Option<String>,

    /// Kinesis stream region
    #[arg(long = "kinesis-stream-region", env = "KINESIS_STREAM_REGION")]
    pub kinesis_stream_region: Option<String>,
}

/// OpenSearch sink.
#[derive(Args, Debug, Clone)]
pub struct OpenSearchArgs {
    /// Cluster URL
    #[arg(long = "opensearch-end-point", env = "OPENSEARCH_END_POINT")]
    pub endpoint: Option<String>,

    /// Target index
    #[arg(long = "opensearch-index-name", env = "OPENSEARCH_INDEX_NAME")]
    pub index_name: Option<String>,

    /// Mirror documents by `_id` instead of recording every event
    #[arg(
        long = "opensearch-sync-enabled",
        env = "OPENSEARCH_SYNC_ENABLED",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub sync_enabled: bool,

    /// Write through the bulk buffer
    #[arg(
        long = "opensearch-bulk-enabled",
        env = "OPENSEARCH_BULK_ENABLED",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub bulk_enabled: bool,

    /// Bulk flush threshold in bytes
    #[arg(
        long = "opensearch-bulk-flush-bytes",
        env = "OPENSEARCH_BULK_FLUSH_BYTES",
        default_value_t = penne_core::bulk::DEFAULT_FLUSH_BYTES
    )]
    pub bulk_flush_bytes: usize,

    /// Periodic bulk flush in seconds; 0 disables it
    #[arg(
        long = "opensearch-bulk-flush-interval-sec",
        env = "OPENSEARCH_BULK_FLUSH_INTERVAL_SEC",
        default_value_t = 0
    )]
    pub bulk_flush_interval_sec: u64,

    /// Keep only the latest pending bulk operation per document
    #[arg(
        long = "opensearch-bulk-sync-aggregation-enabled",
        env = "OPENSEARCH_BULK_SYNC_AGGREGATION_ENABLED",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub bulk_sync_aggregation_enabled: bool,
}

/// Elasticsearch sink.
#[derive(Args, Debug, Clone)]
pub struct ElasticsearchArgs {
    /// Cluster URL
    #[arg(id = "elasticsearch_host", long = "elasticsearch-host", env = "ELASTICSEARCH_HOST")]
    pub host: Option<String>,

    /// Target index
    #[arg(id = "elasticsearch_index_name", long = "elasticsearch-index-name", env = "ELASTICSEARCH_INDEX_NAME")]
    pub index_name: Option<String>,

    /// Mirror documents by `_id` instead of recording every event
    #[arg(
        id = "elasticsearch_sync_enabled",
        long = "elasticsearch-sync-enabled",
        env = "ELASTICSEARCH_SYNC_ENABLED",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub sync_enabled: bool,
}

/// File sink.
#[derive(Args, Debug, Clone)]
pub struct FileExporterArgs {
    /// `stdout` or `file`
    #[arg(long = "file-exporter-writer", env = "FILE_EXPORTER_WRITER", default_value = "stdout")]
    pub writer: String,

    /// Rotate the output file at this size; 0 disables rotation
    #[arg(
        long = "file-exporter-writer-max-megabytes",
        env = "FILE_EXPORTER_WRITER_MAX_MEGABYTES",
        default_value_t = 0
    )]
    pub max_megabytes: u64,

    /// Key holding the log type
    #[arg(long = "file-exporter-log-type", env = "FILE_EXPORTER_LOG_TYPE", default_value = "logType")]
    pub log_type_key: String,

    /// Key holding the event
    #[arg(
        long = "file-exporter-change-stream-key",
        env = "FILE_EXPORTER_CHANGE_STREAM_KEY",
        default_value = "cs"
    )]
    pub change_stream_key: String,

    /// Key holding the write time
    #[arg(long = "file-exporter-time-key", env = "FILE_EXPORTER_TIME_KEY", default_value = "time")]
    pub time_key: String,

    /// Key holding the logger name
    #[arg(long = "file-exporter-name-key", env = "FILE_EXPORTER_NAME_KEY", default_value = "name")]
    pub name_key: String,
}

/// Logging.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// `0` for info, `1` for error, or a filter directive
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "0")]
    pub level: String,

    /// `console` for human-readable output, anything else for JSON
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "json")]
    pub format: String,

    /// Directory of the log file
    #[arg(long = "log-output-directory", env = "LOG_OUTPUT_DIRECTORY")]
    pub output_directory: Option<String>,

    /// Log file name inside the directory
    #[arg(long = "log-output-file", env = "LOG_OUTPUT_FILE")]
    pub output_file: Option<String>,
}

impl LogArgs {
    /// `<directory>/<file>` when both are set and non-empty.
    pub fn output_path(&self) -> Option<std::path::PathBuf> {
        let directory = self.output_directory.as_deref().filter(|d| !d.is_empty())?;
        let file = self.output_file.as_deref().filter(|f| !f.is_empty())?;
        Some(std::path::Path::new(directory).join(file))
    }
}
