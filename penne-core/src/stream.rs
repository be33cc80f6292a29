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

//! Change stream sources.
//!
//! [`ChangeSource`] abstracts "open a change stream with these options and
//! give me raw event documents". [`MongoChangeSource`] implements it on top
//! of the MongoDB driver; tests substitute a scripted source.
//!
//! [`ChangeStreamConfig`] holds the static part of the watch request
//! (pipeline, full document lookup, batch size, field exclusions) and turns
//! it into a [`WatchRequest`] once the stored checkpoint is known.
//!
//! # Field exclusion
//!
//! Sensitive fields can be removed from `fullDocument` server side:
//!
//! ```rust
//! use penne_core::stream::ChangeStreamConfig;
//! use bson::doc;
//!
//! let config = ChangeStreamConfig::builder()
//!     .exclude_full_document_fields(["password", "profile.ssn"])
//!     .build()
//!     .unwrap();
//!
//! let request = config.watch_request(None).unwrap();
//! assert_eq!(
//!     request.pipeline,
//!     vec![doc! { "$project": { "fullDocument.password": 0, "fullDocument.profile.ssn": 0 } }]
//! );
//! ```

use async_trait::async_trait;
use bson::{doc, Document};
use futures::stream::{BoxStream, StreamExt};
use mongodb::{
    change_stream::event::ResumeToken,
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Client, Collection,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while opening or reading a change stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// MongoDB driver error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// MongoDB error code
        code: Option<i32>,
        /// MongoDB error labels (e.g., "NetworkError")
        labels: Vec<String>,
    },

    /// The watched database or collection does not exist
    #[error("{kind} `{name}` not found")]
    NamespaceNotFound {
        /// "database" or "collection"
        kind: &'static str,
        name: String,
    },

    /// Resume token is invalid or the oplog no longer covers it (code 286)
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken { code: i32 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl StreamError {
    /// Creates a StreamError from a MongoDB error, keeping its code and
    /// labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(286) {
            return Self::InvalidResumeToken { code: 286 };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Returns true if restarting the relay could clear this error.
    ///
    /// Labels are checked first, then the transient server codes:
    /// 6, 7, 43, 89, 91, 10107, 11600, 11602, 13435, 13436.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels
                    .iter()
                    .any(|l| l == "NetworkError" || l == "ResumableChangeStreamError")
                {
                    return true;
                }
                matches!(
                    code,
                    Some(6 | 7 | 43 | 89 | 91 | 10107 | 11600 | 11602 | 13435 | 13436)
                )
            }
            Self::NamespaceNotFound { .. }
            | Self::InvalidResumeToken { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::NamespaceNotFound { .. } => "namespace",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// A fully resolved watch request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WatchRequest {
    /// Aggregation stages appended to the change stream
    pub pipeline: Vec<Document>,
    /// Request `fullDocument: "updateLookup"`
    pub full_document_update_lookup: bool,
    /// Cursor batch size
    pub batch_size: Option<u32>,
    /// Resume marker `{"_data": <checkpoint>}`
    pub resume_after: Option<Document>,
}

impl WatchRequest {
    /// Builds the resume marker for a checkpoint value.
    #[must_use]
    pub fn resume_marker(checkpoint: &str) -> Document {
        doc! { "_data": checkpoint }
    }

    /// Converts this request to the driver's options.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the resume marker cannot be
    /// converted into a driver resume token.
    pub fn to_mongo_options(&self) -> Result<ChangeStreamOptions, StreamError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_update_lookup {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.batch_size = self.batch_size;

        if let Some(marker) = &self.resume_after {
            let bytes = bson::to_vec(marker)
                .map_err(|e| StreamError::Configuration(format!("invalid resume marker: {e}")))?;
            let token = bson::from_slice::<ResumeToken>(&bytes)
                .map_err(|e| StreamError::Configuration(format!("invalid resume marker: {e}")))?;
            options.resume_after = Some(token);
        }

        Ok(options)
    }
}

/// Splits a comma separated field list, trimming entries and dropping
/// empty ones.
#[must_use]
pub fn parse_field_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds the `$project` stage excluding `fields` from `fullDocument`.
///
/// Each entry is a path relative to `fullDocument` and may be dotted. Empty
/// paths, empty segments, `$`-prefixed segments and `_id` are rejected.
///
/// # Errors
///
/// Returns [`StreamError::Configuration`] naming the first invalid path.
pub fn exclusion_stage<S: AsRef<str>>(fields: &[S]) -> Result<Option<Document>, StreamError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut projection = Document::new();
    for field in fields {
        let field = field.as_ref();
        validate_exclusion(field)?;
        projection.insert(format!("fullDocument.{field}"), 0);
    }
    Ok(Some(doc! { "$project": projection }))
}

fn validate_exclusion(field: &str) -> Result<(), StreamError> {
    let invalid = |reason: &str| {
        Err(StreamError::Configuration(format!(
            "cannot exclude fullDocument field `{field}`: {reason}"
        )))
    };

    if field.is_empty() {
        return invalid("empty path");
    }
    let mut segments = field.split('.');
    if segments.clone().any(str::is_empty) {
        return invalid("empty path segment");
    }
    if segments.clone().any(|s| s.starts_with('$')) {
        return invalid("operators are not allowed");
    }
    if segments.next() == Some("_id") {
        return invalid("the document _id is required downstream");
    }
    Ok(())
}

/// Static change stream configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeStreamConfig {
    /// Extra aggregation stages, applied before the exclusion stage
    pub pipeline: Vec<Document>,
    /// Request `fullDocument: "updateLookup"` (default: true)
    pub full_document_on_update: bool,
    /// Cursor batch size
    pub batch_size: Option<u32>,
    /// Paths inside `fullDocument` to remove server side
    pub excluded_fields: Vec<String>,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            batch_size: None,
            excluded_fields: Vec::new(),
        }
    }
}

impl ChangeStreamConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ChangeStreamConfigBuilder {
        ChangeStreamConfigBuilder::default()
    }

    /// Resolves the watch request for an optional stored checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if an excluded path is invalid.
    pub fn watch_request(&self, checkpoint: Option<&str>) -> Result<WatchRequest, StreamError> {
        let mut pipeline = self.pipeline.clone();
        if let Some(stage) = exclusion_stage(&self.excluded_fields)? {
            pipeline.push(stage);
        }

        Ok(WatchRequest {
            pipeline,
            full_document_update_lookup: self.full_document_on_update,
            batch_size: self.batch_size,
            resume_after: checkpoint
                .filter(|c| !c.is_empty())
                .map(WatchRequest::resume_marker),
        })
    }
}

/// Builder for [`ChangeStreamConfig`].
#[derive(Debug, Default)]
pub struct ChangeStreamConfigBuilder {
    pipeline: Vec<Document>,
    full_document_on_update: Option<bool>,
    batch_size: Option<u32>,
    excluded_fields: Vec<String>,
}

impl ChangeStreamConfigBuilder {
    /// Sets extra aggregation stages.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Enables or disables the update lookup of `fullDocument`.
    #[must_use]
    pub fn full_document_update_lookup(mut self, enabled: bool) -> Self {
        self.full_document_on_update = Some(enabled);
        self
    }

    /// Sets the cursor batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Adds paths inside `fullDocument` to exclude.
    #[must_use]
    pub fn exclude_full_document_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if an excluded path is invalid
    /// or the batch size is zero.
    pub fn build(self) -> Result<ChangeStreamConfig, StreamError> {
        if self.batch_size == Some(0) {
            return Err(StreamError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        exclusion_stage(&self.excluded_fields)?;

        Ok(ChangeStreamConfig {
            pipeline: self.pipeline,
            full_document_on_update: self.full_document_on_update.unwrap_or(true),
            batch_size: self.batch_size,
            excluded_fields: self.excluded_fields,
        })
    }
}

/// Raw change stream documents.
pub type EventStream = BoxStream<'static, Result<Document, StreamError>>;

/// Something that can open a change stream.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Opens a change stream for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError`] if the stream cannot be opened.
    async fn watch(&self, request: &WatchRequest) -> Result<EventStream, StreamError>;
}

/// [`ChangeSource`] backed by a MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoChangeSource {
    client: Client,
    database: String,
    collection: String,
}

impl MongoChangeSource {
    /// Creates a source for `database.collection`.
    pub fn new(client: Client, database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Checks that the database and collection exist.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NamespaceNotFound`] for a missing namespace, or
    /// the driver error if the listing failed.
    pub async fn verify_namespace(&self) -> Result<Collection<Document>, StreamError> {
        let databases = self.client.list_database_names().await?;
        if !databases.contains(&self.database) {
            return Err(StreamError::NamespaceNotFound {
                kind: "database",
                name: self.database.clone(),
            });
        }

        let db = self.client.database(&self.database);
        let collections = db.list_collection_names().await?;
        if !collections.contains(&self.collection) {
            return Err(StreamError::NamespaceNotFound {
                kind: "collection",
                name: self.collection.clone(),
            });
        }

        Ok(db.collection::<Document>(&self.collection))
    }
}

#[async_trait]
impl ChangeSource for MongoChangeSource {
    #[instrument(skip(self, request), fields(database = %self.database, collection = %self.collection))]
    async fn watch(&self, request: &WatchRequest) -> Result<EventStream, StreamError> {
        let collection = self.verify_namespace().await?;
        let options = request.to_mongo_options()?;
        debug!(stages = request.pipeline.len(), resuming = request.resume_after.is_some(), "Opening change stream");

        let stream = collection
            .watch()
            .pipeline(request.pipeline.clone())
            .with_options(options)
            .await?
            .with_type::<Document>();

        info!("Change stream opened");
        Ok(stream.map(|item| item.map_err(StreamError::from)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_field_list_trims_and_drops_empty() {
        assert_eq!(parse_field_list(" a, b.c ,,"), vec!["a", "b.c"]);
        assert!(parse_field_list("").is_empty());
    }

    #[test]
    fn exclusion_rejects_invalid_paths() {
        for bad in ["", "a..b", ".a", "$where", "a.$b", "_id", "_id.x"] {
            assert!(exclusion_stage(&[bad]).is_err(), "{bad:?} should be rejected");
        }
        assert!(exclusion_stage::<&str>(&[]).unwrap().is_none());
    }

    #[test]
    fn exclusion_allows_nested_paths() {
        let stage = exclusion_stage(&["profile.ssn", "user_id"]).unwrap().unwrap();
        assert_eq!(
            stage,
            doc! { "$project": { "fullDocument.profile.ssn": 0, "fullDocument.user_id": 0 } }
        );
    }

    #[test]
    fn builder_validates_exclusions() {
        let err = ChangeStreamConfig::builder()
            .exclude_full_document_fields(["_id"])
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamError::Configuration(_)));
    }

    #[test]
    fn watch_request_resume_marker() {
        let config = ChangeStreamConfig::builder().build().unwrap();
        assert!(config.full_document_on_update);

        let fresh = config.watch_request(None).unwrap();
        assert!(fresh.resume_after.is_none());
        assert!(fresh.pipeline.is_empty());

        let empty = config.watch_request(Some("")).unwrap();
        assert!(empty.resume_after.is_none());

        let resumed = config.watch_request(Some("8263A1")).unwrap();
        assert_eq!(resumed.resume_after, Some(doc! { "_data": "8263A1" }));
    }

    #[test]
    fn hand_built_config_with_invalid_path_is_rejected() {
        let config = ChangeStreamConfig {
            excluded_fields: vec!["password".to_string(), "_id".to_string()],
            ..ChangeStreamConfig::default()
        };
        assert!(matches!(
            config.watch_request(None),
            Err(StreamError::Configuration(_))
        ));

        let config = ChangeStreamConfig {
            excluded_fields: vec!["password".to_string()],
            ..ChangeStreamConfig::default()
        };
        assert_eq!(
            config.watch_request(None).unwrap().pipeline,
            vec![doc! { "$project": { "fullDocument.password": 0 } }]
        );
    }

    #[test]
    fn mongo_options_carry_resume_token() {
        let request = ChangeStreamConfig::default().watch_request(Some("8263A1")).unwrap();
        let options = request.to_mongo_options().unwrap();
        assert!(options.resume_after.is_some());
        assert!(matches!(options.full_document, Some(FullDocumentType::UpdateLookup)));
    }

    #[test]
    fn retryable_classification() {
        let err = StreamError::Connection {
            message: "not primary".to_string(),
            source: None,
            code: Some(10107),
            labels: Vec::new(),
        };
        assert!(err.is_retryable());
        assert!(!StreamError::InvalidResumeToken { code: 286 }.is_retryable());
        assert_eq!(StreamError::Configuration(String::new()).error_type(), "configuration");
    }
}
