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

//! Kinesis Data Streams sink.
//!
//! Each event is sent as one `PutRecord` call whose data is the
//! pipe-delimited [`ChangeRecord`] followed by a newline. The resume token
//! is the partition key, so records spread evenly across shards.

use crate::record::ChangeRecord;
use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, SdkError};
use aws_sdk_kinesis::operation::put_record::PutRecordError;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client as KinesisClient;
use chrono_tz::Tz;
use penne_core::event::ChangeEvent;
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use std::sync::Arc;
use tracing::{info, trace};

/// Registry name of this sink.
pub const SINK_NAME: &str = "kinesisStream";

/// Kinesis rejects partition keys longer than this.
pub const MAX_PARTITION_KEY_LEN: usize = 256;

/// The single Kinesis call the sink makes.
#[async_trait]
pub trait PutRecordApi: Send + Sync {
    /// Writes one record to `stream`.
    async fn put_record(&self, stream: &str, partition_key: &str, data: Vec<u8>) -> Result<(), SinkError>;
}

#[async_trait]
impl PutRecordApi for KinesisClient {
    async fn put_record(&self, stream: &str, partition_key: &str, data: Vec<u8>) -> Result<(), SinkError> {
        KinesisClient::put_record(self)
            .stream_name(stream)
            .partition_key(partition_key)
            .data(Blob::new(data))
            .send()
            .await
            .map(|_| ())
            .map_err(classify_put_error)
    }
}

fn classify_put_error(error: SdkError<PutRecordError>) -> SinkError {
    let message = DisplayErrorContext(&error).to_string();
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => SinkError::connection_msg(message),
        SdkError::ServiceError(e) => {
            let throttled = e.err().is_provisioned_throughput_exceeded_exception()
                || e.err().is_kms_throttling_exception();
            SinkError::write_msg(message, throttled)
        }
        _ => SinkError::write_msg(message, false),
    }
}

/// Configuration for [`KinesisSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinesisConfig {
    /// Target stream name
    pub stream_name: String,
    /// AWS region of the stream
    pub region: String,
    /// Zone for the cluster time column
    pub time_zone: Tz,
}

/// Writes one Kinesis record per event.
pub struct KinesisSink {
    config: KinesisConfig,
    api: Arc<dyn PutRecordApi>,
}

impl std::fmt::Debug for KinesisSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinesisSink").field("config", &self.config).finish_non_exhaustive()
    }
}

impl KinesisSink {
    /// Creates the Kinesis client from the default credential chain.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the stream name is empty.
    pub async fn new(config: KinesisConfig) -> Result<Self, SinkError> {
        if config.stream_name.trim().is_empty() {
            return Err(SinkError::configuration(
                "Kinesis stream name is required",
                Some("KINESIS_STREAM_NAME".to_string()),
            ));
        }
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        let client = KinesisClient::new(&aws_config);
        info!(stream = %config.stream_name, region = %config.region, "Kinesis sink initialized");
        Ok(Self::with_api(config, Arc::new(client)))
    }

    /// Builds a sink on top of an explicit client.
    pub fn with_api(config: KinesisConfig, api: Arc<dyn PutRecordApi>) -> Self {
        Self { config, api }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &KinesisConfig {
        &self.config
    }
}

/// Truncates the resume token to the Kinesis partition key limit.
fn partition_key(checkpoint: &str) -> &str {
    match checkpoint.char_indices().nth(MAX_PARTITION_KEY_LEN) {
        Some((end, _)) => &checkpoint[..end],
        None => checkpoint,
    }
}

#[async_trait]
impl SinkAdapter for KinesisSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let mut data = ChangeRecord::from_event(event, self.config.time_zone).to_pipe_line();
        data.push('\n');
        let key = partition_key(event.checkpoint());

        self.api
            .put_record(&self.config.stream_name, key, data.into_bytes())
            .await?;
        trace!(stream = %self.config.stream_name, partition_key = key, "Put record");
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
    struct RecordingApi {
        records: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl PutRecordApi for RecordingApi {
        async fn put_record(&self, stream: &str, partition_key: &str, data: Vec<u8>) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::write_msg("throughput exceeded", true));
            }
            self.records
                .lock()
                .unwrap()
                .push((stream.to_string(), partition_key.to_string(), data));
            Ok(())
        }
    }

    fn config() -> KinesisConfig {
        KinesisConfig {
            stream_name: "orders-cdc".to_string(),
            region: "ap-northeast-1".to_string(),
            time_zone: Tz::UTC,
        }
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new("00000", OperationType::Insert, Namespace::new("shop", "orders"))
            .with_document_key(doc! { "_id": 1 })
    }

    #[tokio::test]
    async fn puts_pipe_record_keyed_by_token() {
        let api = Arc::new(RecordingApi::default());
        let sink = KinesisSink::with_api(config(), Arc::clone(&api) as Arc<dyn PutRecordApi>);

        assert_eq!(sink.deliver(&event()).await.unwrap(), Delivery::Delivered);

        let records = api.records.lock().unwrap();
        let (stream, key, data) = &records[0];
        assert_eq!(stream, "orders-cdc");
        assert_eq!(key, "00000");
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.trim_end().split('|').count(), 7);
        assert!(text.starts_with(r#"{"_data":"00000"}|insert|1970-01-01 00:00:00|null|"#));
    }

    #[tokio::test]
    async fn put_failure_is_reported() {
        let api = Arc::new(RecordingApi {
            fail: true,
            ..RecordingApi::default()
        });
        let sink = KinesisSink::with_api(config(), api);
        let err = sink.deliver(&event()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn long_tokens_are_truncated() {
        let token = "A".repeat(300);
        assert_eq!(partition_key(&token).len(), MAX_PARTITION_KEY_LEN);
        assert_eq!(partition_key("826A"), "826A");
    }
}
