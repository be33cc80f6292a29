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

//! Change stream event representation.
//!
//! A [`ChangeEvent`] is decoded once from the raw BSON document the cursor
//! yields and then shared (behind an `Arc`) by every sink the event is
//! fanned out to. Decoding is strict about the fields the relay depends on
//! (`_id._data`, `operationType`, `clusterTime`, `ns`) and lenient about
//! everything else.
//!
//! # Examples
//!
//! ```rust
//! use penne_core::event::{ChangeEvent, OperationType};
//! use bson::{doc, Timestamp};
//!
//! let raw = doc! {
//!     "_id": { "_data": "8263A1" },
//!     "operationType": "insert",
//!     "clusterTime": Timestamp { time: 1_700_000_000, increment: 1 },
//!     "ns": { "db": "shop", "coll": "orders" },
//!     "documentKey": { "_id": 42 },
//!     "fullDocument": { "_id": 42, "total": 10 },
//! };
//!
//! let event = ChangeEvent::from_document(raw).unwrap();
//! assert_eq!(event.operation, OperationType::Insert);
//! assert_eq!(event.checkpoint(), "8263A1");
//! assert_eq!(event.document_id_string().as_deref(), Some("42"));
//! ```

use bson::document::{ValueAccessError, ValueAccessResult};
use bson::{doc, Bson, Document, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Error raised when a raw change stream document cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// A field the relay depends on is absent.
    #[error("change event is missing required field `{0}`")]
    MissingField(&'static str),

    /// A field is present but has the wrong BSON type.
    #[error("change event field `{field}` has unexpected type (expected {expected})")]
    InvalidField {
        /// Dotted path of the offending field
        field: &'static str,
        /// Human readable name of the expected type
        expected: &'static str,
    },

    /// `updateDescription` did not have the documented shape.
    #[error("failed to decode updateDescription: {0}")]
    UpdateDescription(String),
}

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps the relay forward compatible with operation
/// types introduced by newer servers (`createIndexes`, `modify`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,
    /// A document was updated in place
    Update,
    /// A document was replaced entirely
    Replace,
    /// A document was deleted
    Delete,
    /// The change stream was invalidated
    Invalidate,
    /// A collection was dropped
    Drop,
    /// A database was dropped
    DropDatabase,
    /// A collection was renamed
    Rename,
    /// An operation type this relay does not model
    Unknown(String),
}

impl OperationType {
    /// Returns the wire name used by the server.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(other) => other,
        }
    }

    /// Returns true for operations that carry a single document (insert,
    /// update, replace, delete).
    #[inline]
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Replace | Self::Delete
        )
    }

    /// Returns true if this is an operation type the relay does not model.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl From<&str> for OperationType {
    fn from(value: &str) -> Self {
        match value {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "replace" => Self::Replace,
            "delete" => Self::Delete,
            "invalidate" => Self::Invalidate,
            "drop" => Self::Drop,
            "dropDatabase" => Self::DropDatabase,
            "rename" => Self::Rename,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MongoDB namespace (database + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name, empty for database level events
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    fn to_document(&self) -> Document {
        doc! { "db": self.database.clone(), "coll": self.collection.clone() }
    }
}

/// Update description for partial document updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields", default)]
    pub updated_fields: Document,

    /// Fields that were removed from the document
    #[serde(rename = "removedFields", default)]
    pub removed_fields: Vec<String>,

    /// Array truncations, if any
    #[serde(rename = "truncatedArrays", skip_serializing_if = "Option::is_none")]
    pub truncated_arrays: Option<Vec<TruncatedArray>>,
}

impl UpdateDescription {
    fn to_document(&self) -> Document {
        let mut out = doc! {
            "updatedFields": self.updated_fields.clone(),
            "removedFields": self.removed_fields.clone(),
        };
        if let Some(arrays) = &self.truncated_arrays {
            let arrays: Vec<Bson> = arrays
                .iter()
                .map(|a| Bson::Document(doc! { "field": a.field.clone(), "newSize": i64::from(a.new_size) }))
                .collect();
            out.insert("truncatedArrays", arrays);
        }
        out
    }
}

/// Describes a truncated array field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedArray {
    /// Field path to the array
    pub field: String,

    /// New size of the array after truncation
    #[serde(rename = "newSize")]
    pub new_size: u32,
}

/// A decoded MongoDB change stream event.
///
/// Immutable once decoded. The dispatcher wraps it in an `Arc` so that all
/// sinks observe the same value.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The event's `_id`, an opaque resume token containing `_data`
    pub resume_token: Document,

    /// Type of operation
    pub operation: OperationType,

    /// Logical server time of the operation
    pub cluster_time: Timestamp,

    /// Namespace the operation applied to
    pub namespace: Namespace,

    /// `documentKey`, present for document level operations
    pub document_key: Option<Document>,

    /// `fullDocument`, present for inserts, replaces and looked-up updates
    pub full_document: Option<Document>,

    /// `updateDescription`, present for updates
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    /// Creates an event with the given checkpoint value and no document data.
    ///
    /// Mostly useful for sinks and tests that synthesize events; the relay
    /// itself always goes through [`ChangeEvent::from_document`].
    pub fn new(checkpoint: impl Into<String>, operation: OperationType, namespace: Namespace) -> Self {
        Self {
            resume_token: doc! { "_data": checkpoint.into() },
            operation,
            cluster_time: Timestamp {
                time: 0,
                increment: 0,
            },
            namespace,
            document_key: None,
            full_document: None,
            update_description: None,
        }
    }

    /// Sets the cluster time.
    #[must_use]
    pub fn with_cluster_time(mut self, time: u32, increment: u32) -> Self {
        self.cluster_time = Timestamp { time, increment };
        self
    }

    /// Sets `documentKey`.
    #[must_use]
    pub fn with_document_key(mut self, key: Document) -> Self {
        self.document_key = Some(key);
        self
    }

    /// Sets `fullDocument`.
    #[must_use]
    pub fn with_full_document(mut self, document: Document) -> Self {
        self.full_document = Some(document);
        self
    }

    /// Sets `updateDescription`.
    #[must_use]
    pub fn with_update_description(mut self, description: UpdateDescription) -> Self {
        self.update_description = Some(description);
        self
    }

    /// Decodes a raw change stream document.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] if `_id._data`, `operationType`,
    /// `clusterTime` or `ns.db` are missing or mistyped, or if an optional
    /// field is present with an unexpected type.
    pub fn from_document(raw: Document) -> Result<Self, ConversionError> {
        let resume_token = required(raw.get_document("_id"), "_id", "document")?.clone();
        required(resume_token.get_str("_data"), "_id._data", "string")?;

        let operation = OperationType::from(required(
            raw.get_str("operationType"),
            "operationType",
            "string",
        )?);
        let cluster_time = required(raw.get_timestamp("clusterTime"), "clusterTime", "timestamp")?;

        let ns = required(raw.get_document("ns"), "ns", "document")?;
        let namespace = Namespace {
            database: required(ns.get_str("db"), "ns.db", "string")?.to_string(),
            collection: optional(ns.get_str("coll"), "ns.coll", "string")?
                .unwrap_or_default()
                .to_string(),
        };

        let document_key = optional(raw.get_document("documentKey"), "documentKey", "document")?
            .cloned();
        let full_document = match raw.get("fullDocument") {
            None | Some(Bson::Null) => None,
            Some(Bson::Document(d)) => Some(d.clone()),
            Some(_) => {
                return Err(ConversionError::InvalidField {
                    field: "fullDocument",
                    expected: "document",
                })
            }
        };
        let update_description = optional(
            raw.get_document("updateDescription"),
            "updateDescription",
            "document",
        )?
        .map(|d| bson::from_document::<UpdateDescription>(d.clone()))
        .transpose()
        .map_err(|e| ConversionError::UpdateDescription(e.to_string()))?;

        Ok(Self {
            resume_token,
            operation,
            cluster_time,
            namespace,
            document_key,
            full_document,
            update_description,
        })
    }

    /// Returns the checkpoint value for this event (the `_data` string of
    /// its resume token).
    pub fn checkpoint(&self) -> &str {
        self.resume_token.get_str("_data").unwrap_or_default()
    }

    /// Returns the cluster time as a UTC wall clock instant (second precision).
    pub fn cluster_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.cluster_time.time), 0).unwrap_or_default()
    }

    /// Returns the `_id` value from `documentKey`.
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Renders the document `_id` as a string: ObjectIds as hex, strings
    /// verbatim, anything else as relaxed extended JSON.
    pub fn document_id_string(&self) -> Option<String> {
        match self.document_id()? {
            Bson::ObjectId(oid) => Some(oid.to_hex()),
            Bson::String(s) => Some(s.clone()),
            other => Some(other.clone().into_relaxed_extjson().to_string()),
        }
    }

    /// Returns the database name.
    #[inline]
    pub fn database_name(&self) -> &str {
        &self.namespace.database
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// Renders one top level field of the event as relaxed extended JSON.
    ///
    /// Accepted names are the server field names (`_id`, `operationType`,
    /// `clusterTime`, `ns`, `documentKey`, `fullDocument`,
    /// `updateDescription`). Absent or unknown fields render as `null`.
    pub fn field_json(&self, name: &str) -> Value {
        let bson = match name {
            "_id" => Some(Bson::Document(self.resume_token.clone())),
            "operationType" => Some(Bson::String(self.operation.as_str().to_string())),
            "clusterTime" => Some(Bson::Timestamp(self.cluster_time)),
            "ns" => Some(Bson::Document(self.namespace.to_document())),
            "documentKey" => self.document_key.clone().map(Bson::Document),
            "fullDocument" => self.full_document.clone().map(Bson::Document),
            "updateDescription" => self
                .update_description
                .as_ref()
                .map(|u| Bson::Document(u.to_document())),
            _ => None,
        };
        bson.map_or(Value::Null, Bson::into_relaxed_extjson)
    }

    /// Renders the whole event as a relaxed extended JSON object, omitting
    /// absent optional fields.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for name in EVENT_FIELDS {
            let value = self.field_json(name);
            if !value.is_null() {
                map.insert(name.to_string(), value);
            }
        }
        Value::Object(map)
    }
}

const EVENT_FIELDS: [&str; 7] = [
    "_id",
    "operationType",
    "clusterTime",
    "ns",
    "documentKey",
    "fullDocument",
    "updateDescription",
];

fn required<T>(
    result: ValueAccessResult<T>,
    field: &'static str,
    expected: &'static str,
) -> Result<T, ConversionError> {
    result.map_err(|e| match e {
        ValueAccessError::NotPresent => ConversionError::MissingField(field),
        _ => ConversionError::InvalidField { field, expected },
    })
}

fn optional<T>(
    result: ValueAccessResult<T>,
    field: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConversionError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ValueAccessError::NotPresent) => Ok(None),
        Err(_) => Err(ConversionError::InvalidField { field, expected }),
    }
}
