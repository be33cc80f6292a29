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

//! S3 checkpoint store.
//!
//! Stores each checkpoint as one object in a bucket. Works against AWS and
//! S3-compatible services (LocalStack, MinIO) through a custom endpoint and
//! path-style addressing.
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_stores::s3::{S3Store, S3StoreConfig};
//! use penne_core::checkpoint::CheckpointStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = S3StoreConfig::builder()
//!     .bucket("relay-checkpoints")
//!     .region("ap-northeast-1")
//!     .build()?;
//!
//! let store = S3Store::new(config).await;
//! store.put("tokens/orders.dat", b"826A01").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use crate::object_name;
use penne_core::checkpoint::{CheckpointError, CheckpointStore};
use tracing::{debug, info};

/// Configuration for [`S3Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3StoreConfig {
    /// Bucket holding the checkpoint objects
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (LocalStack, MinIO)
    pub endpoint_url: Option<String>,
    /// Use path-style addressing
    pub force_path_style: bool,
    /// SDK retry attempts
    pub max_retries: u32,
}

impl S3StoreConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> S3StoreConfigBuilder {
        S3StoreConfigBuilder::default()
    }
}

/// Builder for [`S3StoreConfig`].
#[derive(Debug, Default)]
pub struct S3StoreConfigBuilder {
    bucket: Option<String>,
    region: Option<String>,
    endpoint_url: Option<String>,
    force_path_style: bool,
    max_retries: Option<u32>,
}

impl S3StoreConfigBuilder {
    /// Sets the bucket (required).
    #[must_use]
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets the region. Defaults to `us-east-1`.
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets a custom endpoint URL.
    #[must_use]
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Enables path-style addressing.
    #[must_use]
    pub fn force_path_style(mut self, enabled: bool) -> Self {
        self.force_path_style = enabled;
        self
    }

    /// Sets the SDK retry attempts. Defaults to 3.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket is missing or empty.
    pub fn build(self) -> Result<S3StoreConfig, String> {
        let bucket = self
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or_else(|| "bucket is required".to_string())?;
        let region = self
            .region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        Ok(S3StoreConfig {
            bucket,
            region,
            endpoint_url: self.endpoint_url,
            force_path_style: self.force_path_style,
            max_retries: self.max_retries.unwrap_or(3),
        })
    }
}

/// [`CheckpointStore`] backed by S3.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
    config: S3StoreConfig,
}

impl S3Store {
    /// Creates the S3 client from the default credential chain.
    pub async fn new(config: S3StoreConfig) -> Self {
        info!(bucket = %config.bucket, region = %config.region, "Initializing S3 checkpoint store");

        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint_url) = &config.endpoint_url {
            debug!(endpoint_url, "Using custom S3 endpoint");
            aws_config_builder = aws_config_builder.endpoint_url(endpoint_url);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config).retry_config(
            aws_sdk_s3::config::retry::RetryConfig::standard().with_max_attempts(config.max_retries),
        );
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        Self { client, config }
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

fn classify_s3_error<E, R>(error: SdkError<E, R>) -> CheckpointError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            CheckpointError::Connection(DisplayErrorContext(&error).to_string())
        }
        SdkError::ConstructionFailure(_) => {
            CheckpointError::Other(format!("S3 client misconfigured: {}", DisplayErrorContext(&error)))
        }
        _ => CheckpointError::Other(DisplayErrorContext(&error).to_string()),
    }
}

#[async_trait]
impl CheckpointStore for S3Store {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        let object = object_name(key);
        let output = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(object)
            .send()
            .await
        {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(CheckpointError::NotFound(key.to_string()));
            }
            Err(e) => return Err(classify_s3_error(e)),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| CheckpointError::Connection(format!("failed to read S3 object body: {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError> {
        let object = object_name(key);
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(object)
            .content_type("text/plain")
            .body(ByteStream::from(value.to_vec()))
            .send()
            .await
            .map_err(classify_s3_error)?;
        debug!(bucket = %self.config.bucket, key = object, "Checkpoint object written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(object_name(key))
            .send()
            .await
            .map_err(classify_s3_error)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_bucket() {
        assert!(S3StoreConfig::builder().build().is_err());
        assert!(S3StoreConfig::builder().bucket("").build().is_err());
    }

    #[test]
    fn builder_defaults() {
        let config = S3StoreConfig::builder().bucket("b").build().unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.max_retries, 3);
        assert!(!config.force_path_style);
    }
}
