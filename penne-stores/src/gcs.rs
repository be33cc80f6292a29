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

//! Google Cloud Storage checkpoint store.
//!
//! Credentials come from Application Default Credentials.

use crate::object_name;
use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use penne_core::checkpoint::{CheckpointError, CheckpointStore};
use tracing::{debug, info};

/// [`CheckpointStore`] backed by a GCS bucket.
#[derive(Clone)]
pub struct GcsStore {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for GcsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStore").field("bucket", &self.bucket).finish_non_exhaustive()
    }
}

impl GcsStore {
    /// Creates a store for `bucket` using Application Default Credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Connection`] if credentials cannot be
    /// resolved, or [`CheckpointError::Other`] if `bucket` is empty.
    pub async fn new(bucket: impl Into<String>) -> Result<Self, CheckpointError> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(CheckpointError::Other("GCS bucket name is required".to_string()));
        }

        let config = ClientConfig::default().with_auth().await.map_err(|e| {
            CheckpointError::Connection(format!("failed to initialize GCS client with ADC: {e}"))
        })?;
        info!(bucket = %bucket, "Initialized GCS checkpoint store");
        Ok(Self {
            client: Client::new(config),
            bucket,
        })
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn classify_gcs_error(error: GcsError) -> CheckpointError {
    match error {
        GcsError::HttpClient(e) => CheckpointError::Connection(e.to_string()),
        other => CheckpointError::Other(other.to_string()),
    }
}

fn is_not_found(error: &GcsError) -> bool {
    matches!(error, GcsError::Response(response) if response.code == 404)
}

#[async_trait]
impl CheckpointStore for GcsStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: object_name(key).to_string(),
            ..Default::default()
        };
        match self.client.download_object(&request, &Range::default()).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if is_not_found(&e) => Err(CheckpointError::NotFound(key.to_string())),
            Err(e) => Err(classify_gcs_error(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError> {
        let object = object_name(key).to_string();
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let upload_type = UploadType::Simple(Media::new(object.clone()));
        self.client
            .upload_object(&request, value.to_vec(), &upload_type)
            .await
            .map_err(classify_gcs_error)?;
        debug!(bucket = %self.bucket, object = %object, "Checkpoint object written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: object_name(key).to_string(),
            ..Default::default()
        };
        match self.client.delete_object(&request).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify_gcs_error(e)),
        }
    }

    fn backend(&self) -> &'static str {
        "gcs"
    }
}
