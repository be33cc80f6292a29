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

//! Builds checkpoint stores and sinks from the process configuration.

use crate::config::{CheckpointArgs, FileExporterArgs, LogArgs, RelayConfig};
use penne_core::checkpoint::{checkpoint_key, default_file_name, CheckpointStore};
use penne_core::sink::{SinkAdapter, SinkError};
use penne_sinks::file::{FileSink, FileSinkConfig, DEFAULT_FILE_PATH};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Startup configuration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A configured sink name is not known.
    #[error("unknown export destination `{0}`")]
    UnknownSink(String),

    /// A sink name appears more than once.
    #[error("export destination `{0}` is configured more than once")]
    DuplicateSink(String),

    /// No sink names were configured.
    #[error("EXPORT_DESTINATION names no sink")]
    NoSinks,

    /// The component exists but was not compiled in.
    #[error("`{name}` requires building with the `{feature}` feature")]
    FeatureDisabled {
        /// Configured name
        name: String,
        /// Cargo feature that provides it
        feature: &'static str,
    },

    /// The checkpoint backend is not known.
    #[error("unknown resume token volume type `{0}`")]
    UnknownVolumeType(String),

    /// A required setting is missing.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A setting has an invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A sink failed to initialize.
    #[error("failed to initialize sink: {0}")]
    Sink(#[from] SinkError),
}

/// Sinks selectable through `EXPORT_DESTINATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// JSON lines to stdout or a file
    File,
    /// OpenSearch index
    OpenSearch,
    /// Elasticsearch index
    Elasticsearch,
    /// Kinesis Data Streams
    Kinesis,
    /// Google Cloud Pub/Sub
    PubSub,
    /// BigQuery table
    BigQuery,
}

impl SinkKind {
    /// Looks up a configured name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "opensearch" => Some(Self::OpenSearch),
            "elasticsearch" => Some(Self::Elasticsearch),
            "kinesisStream" => Some(Self::Kinesis),
            "pubsub" => Some(Self::PubSub),
            "bigquery" => Some(Self::BigQuery),
            _ => None,
        }
    }

    /// The configured name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::OpenSearch => "opensearch",
            Self::Elasticsearch => "elasticsearch",
            Self::Kinesis => "kinesisStream",
            Self::PubSub => "pubsub",
            Self::BigQuery => "bigquery",
        }
    }

    /// Cargo feature providing the sink, if any.
    pub const fn feature(self) -> Option<&'static str> {
        match self {
            Self::File => None,
            Self::OpenSearch => Some("opensearch"),
            Self::Elasticsearch => Some("elasticsearch"),
            Self::Kinesis => Some("kinesis"),
            Self::PubSub => Some("pubsub"),
            Self::BigQuery => Some("bigquery"),
        }
    }
}

/// Parses a comma-separated sink list. Entries are trimmed and empty
/// entries ignored.
///
/// # Errors
///
/// Rejects unknown names, duplicates and an empty list.
pub fn parse_sink_kinds(raw: &str) -> Result<Vec<SinkKind>, RegistryError> {
    let mut seen = HashSet::new();
    let mut kinds = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let kind = SinkKind::from_name(name).ok_or_else(|| RegistryError::UnknownSink(name.to_string()))?;
        if !seen.insert(kind) {
            return Err(RegistryError::DuplicateSink(name.to_string()));
        }
        kinds.push(kind);
    }
    if kinds.is_empty() {
        return Err(RegistryError::NoSinks);
    }
    Ok(kinds)
}

/// Checkpoint backends selectable through `RESUME_TOKEN_VOLUME_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    /// Local filesystem
    File,
    /// AWS S3
    S3,
    /// Google Cloud Storage
    Gcs,
}

impl VolumeType {
    /// Parses the configured type; empty means [`VolumeType::File`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownVolumeType`] for any other value.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        match raw.trim() {
            "" | "file" => Ok(Self::File),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            other => Err(RegistryError::UnknownVolumeType(other.to_string())),
        }
    }
}

/// The checkpoint key for `collection`.
pub fn checkpoint_key_for(args: &CheckpointArgs, collection: &str) -> String {
    let file_name = args
        .file_name
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map_or_else(|| default_file_name(collection), str::to_string);
    checkpoint_key(&args.volume_dir, &file_name)
}

/// Builds the configured checkpoint store.
///
/// # Errors
///
/// Returns an error for an unknown or disabled backend, or a missing bucket.
pub async fn build_store(args: &CheckpointArgs) -> Result<Arc<dyn CheckpointStore>, RegistryError> {
    let volume = VolumeType::parse(&args.volume_type)?;
    info!(volume = ?volume, "Building checkpoint store");
    match volume {
        VolumeType::File => Ok(Arc::new(penne_stores::file::FileStore::new())),
        VolumeType::S3 => build_s3_store(args).await,
        VolumeType::Gcs => build_gcs_store(args).await,
    }
}

fn bucket(args: &CheckpointArgs) -> Result<String, RegistryError> {
    args.bucket_name
        .clone()
        .filter(|b| !b.trim().is_empty())
        .ok_or(RegistryError::Missing("RESUME_TOKEN_VOLUME_BUCKET_NAME"))
}

#[cfg(feature = "s3")]
async fn build_s3_store(args: &CheckpointArgs) -> Result<Arc<dyn CheckpointStore>, RegistryError> {
    use penne_stores::s3::{S3Store, S3StoreConfig};

    let mut builder = S3StoreConfig::builder().bucket(bucket(args)?);
    if let Some(region) = &args.bucket_region {
        builder = builder.region(region.clone());
    }
    let config = builder.build().map_err(RegistryError::Invalid)?;
    Ok(Arc::new(S3Store::new(config).await))
}

#[cfg(not(feature = "s3"))]
async fn build_s3_store(args: &CheckpointArgs) -> Result<Arc<dyn CheckpointStore>, RegistryError> {
    bucket(args)?;
    Err(RegistryError::FeatureDisabled {
        name: "s3".to_string(),
        feature: "s3",
    })
}

#[cfg(feature = "gcs")]
async fn build_gcs_store(args: &CheckpointArgs) -> Result<Arc<dyn CheckpointStore>, RegistryError> {
    let store = penne_stores::gcs::GcsStore::new(bucket(args)?)
        .await
        .map_err(|e| RegistryError::Invalid(format!("GCS checkpoint store: {e}")))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "gcs"))]
async fn build_gcs_store(args: &CheckpointArgs) -> Result<Arc<dyn CheckpointStore>, RegistryError> {
    bucket(args)?;
    Err(RegistryError::FeatureDisabled {
        name: "gcs".to_string(),
        feature: "gcs",
    })
}

/// Builds every configured sink, in configuration order.
///
/// # Errors
///
/// Returns the first configuration or initialization failure.
pub async fn build_sinks(config: &RelayConfig) -> Result<Vec<Arc<dyn SinkAdapter>>, RegistryError> {
    let kinds = parse_sink_kinds(&config.sinks.export_destination)?;
    let mut sinks = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let sink = build_sink(kind, config).await?;
        info!(sink = kind.name(), "Sink ready");
        sinks.push(sink);
    }
    Ok(sinks)
}

async fn build_sink(kind: SinkKind, config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    match kind {
        SinkKind::File => build_file_sink(&config.file, &config.log).await,
        SinkKind::OpenSearch => build_opensearch_sink(config),
        SinkKind::Elasticsearch => build_elasticsearch_sink(config),
        SinkKind::Kinesis => build_kinesis_sink(config).await,
        SinkKind::PubSub => build_pubsub_sink(config).await,
        SinkKind::BigQuery => build_bigquery_sink(config).await,
    }
}

/// Builds the file sink described by `args`.
///
/// # Errors
///
/// Rejects an unknown writer or clashing keys, and fails if the output file
/// cannot be opened.
pub async fn build_file_sink(args: &FileExporterArgs, log: &LogArgs) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    let sink_config = FileSinkConfig::builder()
        .time_key(&args.time_key)
        .name_key(&args.name_key)
        .log_type_key(&args.log_type_key)
        .change_stream_key(&args.change_stream_key)
        .max_megabytes(args.max_megabytes)
        .build()
        .map_err(RegistryError::Invalid)?;

    match args.writer.trim() {
        "" | "stdout" => Ok(Arc::new(FileSink::stdout(sink_config))),
        "file" => {
            let path = log
                .output_path()
                .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_FILE_PATH));
            Ok(Arc::new(FileSink::open(path, sink_config).await?))
        }
        other => Err(RegistryError::Invalid(format!(
            "FILE_EXPORTER_WRITER must be `stdout` or `file`, got `{other}`"
        ))),
    }
}

fn time_zone(config: &RelayConfig) -> Result<chrono_tz::Tz, RegistryError> {
    penne_sinks::record::parse_time_zone(&config.sinks.time_zone).map_err(RegistryError::Invalid)
}

#[cfg_attr(
    all(
        feature = "opensearch",
        feature = "elasticsearch",
        feature = "kinesis",
        feature = "pubsub",
        feature = "bigquery"
    ),
    allow(dead_code)
)]
fn disabled(kind: SinkKind) -> RegistryError {
    RegistryError::FeatureDisabled {
        name: kind.name().to_string(),
        feature: kind.feature().unwrap_or_default(),
    }
}

#[cfg(feature = "opensearch")]
fn build_opensearch_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    use penne_sinks::opensearch::{OpenSearchConfig, OpenSearchSink};

    let args = &config.opensearch;
    let endpoint = args
        .endpoint
        .clone()
        .ok_or(RegistryError::Missing("OPENSEARCH_END_POINT"))?;
    let index = args
        .index_name
        .clone()
        .ok_or(RegistryError::Missing("OPENSEARCH_INDEX_NAME"))?;
    let sink_config = OpenSearchConfig::builder()
        .endpoint(endpoint)
        .index(index)
        .sync(args.sync_enabled)
        .bulk(args.bulk_enabled)
        .flush_bytes(args.bulk_flush_bytes)
        .flush_interval(std::time::Duration::from_secs(args.bulk_flush_interval_sec))
        .aggregation(args.bulk_sync_aggregation_enabled)
        .build()
        .map_err(RegistryError::Invalid)?;
    Ok(Arc::new(OpenSearchSink::new(sink_config)?))
}

#[cfg(not(feature = "opensearch"))]
fn build_opensearch_sink(_config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    Err(disabled(SinkKind::OpenSearch))
}

#[cfg(feature = "elasticsearch")]
fn build_elasticsearch_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    use penne_sinks::elasticsearch::{ElasticsearchConfig, ElasticsearchSink};

    let args = &config.elasticsearch;
    let host = args.host.as_deref().ok_or(RegistryError::Missing("ELASTICSEARCH_HOST"))?;
    let index = args
        .index_name
        .as_deref()
        .ok_or(RegistryError::Missing("ELASTICSEARCH_INDEX_NAME"))?;
    let sink_config = ElasticsearchConfig::new(host, index, args.sync_enabled).map_err(RegistryError::Invalid)?;
    Ok(Arc::new(ElasticsearchSink::new(sink_config)?))
}

#[cfg(not(feature = "elasticsearch"))]
fn build_elasticsearch_sink(_config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    Err(disabled(SinkKind::Elasticsearch))
}

#[cfg(feature = "kinesis")]
async fn build_kinesis_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    use penne_sinks::kinesis::{KinesisConfig, KinesisSink};

    let stream_name = config
        .sinks
        .kinesis_stream_name
        .clone()
        .ok_or(RegistryError::Missing("KINESIS_STREAM_NAME"))?;
    let region = config
        .sinks
        .kinesis_stream_region
        .clone()
        .ok_or(RegistryError::Missing("KINESIS_STREAM_REGION"))?;
    let sink_config = KinesisConfig {
        stream_name,
        region,
        time_zone: time_zone(config)?,
    };
    Ok(Arc::new(KinesisSink::new(sink_config).await?))
}

#[cfg(not(feature = "kinesis"))]
async fn build_kinesis_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    time_zone(config)?;
    Err(disabled(SinkKind::Kinesis))
}

#[cfg(feature = "pubsub")]
async fn build_pubsub_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    use penne_sinks::pubsub::{PubSubConfig, PubSubSink};

    let project = config
        .sinks
        .project
        .clone()
        .ok_or(RegistryError::Missing("PROJECT_NAME_TO_EXPORT_CHANGE_STREAMS"))?;
    let sink_config = PubSubConfig::resolve(
        project,
        config.sinks.pubsub_topic.clone(),
        config.sinks.pubsub_subscription.clone(),
        &config.namespace.database,
        &config.namespace.collection,
        time_zone(config)?,
    )
    .map_err(RegistryError::Invalid)?;
    Ok(Arc::new(PubSubSink::new(sink_config).await?))
}

#[cfg(not(feature = "pubsub"))]
async fn build_pubsub_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    time_zone(config)?;
    Err(disabled(SinkKind::PubSub))
}

#[cfg(feature = "bigquery")]
async fn build_bigquery_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    use penne_sinks::bigquery::{BigQueryConfig, BigQuerySink};

    let sink_config = BigQueryConfig {
        project_id: config
            .sinks
            .project
            .clone()
            .ok_or(RegistryError::Missing("PROJECT_NAME_TO_EXPORT_CHANGE_STREAMS"))?,
        dataset: config
            .sinks
            .bigquery_dataset
            .clone()
            .ok_or(RegistryError::Missing("BIGQUERY_DATASET"))?,
        table: config
            .sinks
            .bigquery_table
            .clone()
            .ok_or(RegistryError::Missing("BIGQUERY_TABLE"))?,
        time_zone: time_zone(config)?,
    };
    Ok(Arc::new(BigQuerySink::new(sink_config).await?))
}

#[cfg(not(feature = "bigquery"))]
async fn build_bigquery_sink(config: &RelayConfig) -> Result<Arc<dyn SinkAdapter>, RegistryError> {
    time_zone(config)?;
    Err(disabled(SinkKind::BigQuery))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_list_is_trimmed_and_ordered() {
        let kinds = parse_sink_kinds(" file, ,opensearch ,").unwrap();
        assert_eq!(kinds, vec![SinkKind::File, SinkKind::OpenSearch]);
    }

    #[test]
    fn sink_list_errors() {
        assert!(matches!(parse_sink_kinds(" , "), Err(RegistryError::NoSinks)));
        assert!(matches!(
            parse_sink_kinds("file,elastic"),
            Err(RegistryError::UnknownSink(name)) if name == "elastic"
        ));
        assert!(matches!(
            parse_sink_kinds("file,file"),
            Err(RegistryError::DuplicateSink(_))
        ));
    }

    #[test]
    fn sink_names_round_trip() {
        for kind in [
            SinkKind::File,
            SinkKind::OpenSearch,
            SinkKind::Elasticsearch,
            SinkKind::Kinesis,
            SinkKind::PubSub,
            SinkKind::BigQuery,
        ] {
            assert_eq!(SinkKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(SinkKind::from_name("kinesis"), None);
    }

    #[test]
    fn volume_types() {
        assert_eq!(VolumeType::parse("").unwrap(), VolumeType::File);
        assert_eq!(VolumeType::parse("s3").unwrap(), VolumeType::S3);
        assert_eq!(VolumeType::parse("gcs").unwrap(), VolumeType::Gcs);
        assert!(VolumeType::parse("nfs").is_err());
    }

    fn checkpoint_args(dir: &str, file_name: Option<&str>) -> CheckpointArgs {
        CheckpointArgs {
            volume_dir: dir.to_string(),
            volume_type: String::new(),
            bucket_name: None,
            file_name: file_name.map(str::to_string),
            bucket_region: None,
            save_interval_sec: 0,
        }
    }

    #[test]
    fn checkpoint_key_defaults_to_collection_file() {
        assert_eq!(checkpoint_key_for(&checkpoint_args("/tokens/", None), "orders"), "/tokens/orders.dat");
        assert_eq!(
            checkpoint_key_for(&checkpoint_args("tokens", Some("resume.dat")), "orders"),
            "tokens/resume.dat"
        );
    }

    #[tokio::test]
    async fn object_store_requires_bucket() {
        let mut args = checkpoint_args("tokens", None);
        args.volume_type = "s3".to_string();
        assert!(matches!(
            build_store(&args).await,
            Err(RegistryError::Missing("RESUME_TOKEN_VOLUME_BUCKET_NAME"))
        ));
    }

    fn relay_config(destination: &str) -> RelayConfig {
        use clap::Parser;

        RelayConfig::try_parse_from([
            "penne",
            "--mongodb-host",
            "mongodb://localhost:27017",
            "--mongodb-database",
            "shop",
            "--mongodb-collection",
            "orders",
            "--export-destination",
            destination,
        ])
        .unwrap()
    }

    #[cfg(feature = "elasticsearch")]
    #[tokio::test]
    async fn elasticsearch_needs_host_and_index() {
        let mut config = relay_config("elasticsearch");
        config.elasticsearch.host = None;
        config.elasticsearch.index_name = Some("orders".to_string());
        assert!(matches!(
            build_sinks(&config).await,
            Err(RegistryError::Missing("ELASTICSEARCH_HOST"))
        ));

        config.elasticsearch.host = Some("http://localhost:9200".to_string());
        let sinks = build_sinks(&config).await.unwrap();
        assert_eq!(sinks[0].name(), "elasticsearch");
    }

    #[cfg(not(feature = "elasticsearch"))]
    #[tokio::test]
    async fn elasticsearch_requires_its_feature() {
        assert!(matches!(
            build_sinks(&relay_config("elasticsearch")).await,
            Err(RegistryError::FeatureDisabled { feature: "elasticsearch", .. })
        ));
    }

    #[tokio::test]
    async fn file_writer_must_be_known() {
        let args = FileExporterArgs {
            writer: "syslog".to_string(),
            max_megabytes: 0,
            log_type_key: "logType".to_string(),
            change_stream_key: "cs".to_string(),
            time_key: "time".to_string(),
            name_key: "name".to_string(),
        };
        let log = LogArgs {
            level: "0".to_string(),
            format: "json".to_string(),
            output_directory: None,
            output_file: None,
        };
        assert!(matches!(
            build_file_sink(&args, &log).await,
            Err(RegistryError::Invalid(_))
        ));
    }
}
