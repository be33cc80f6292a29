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

//! Pipe-delimited change record shared by the Kinesis, Pub/Sub and BigQuery
//! sinks.
//!
//! A record is seven fields in fixed order:
//!
//! 1. `_id` as JSON
//! 2. `operationType`
//! 3. `clusterTime` as `%Y-%m-%d %H:%M:%S` in the configured time zone
//! 4. `fullDocument` as JSON
//! 5. `ns` as JSON
//! 6. `documentKey` as JSON
//! 7. `updateDescription` as JSON
//!
//! Absent optional fields encode as `null`.

use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use penne_core::event::ChangeEvent;
use std::str::FromStr;

/// `strftime` pattern for the cluster time column.
pub const CLUSTER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Field separator of the text rendition.
pub const FIELD_SEPARATOR: char = '|';

/// Parses an IANA time zone name. An empty name means UTC.
///
/// # Errors
///
/// Returns a message naming the zone if it is not in the tz database.
pub fn parse_time_zone(name: &str) -> Result<Tz, String> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    Tz::from_str(name).map_err(|_| format!("unknown time zone: {name}"))
}

/// One change event flattened into text columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// `_id` (the resume token) as JSON
    pub id: String,
    /// Operation type as reported by the server
    pub operation_type: String,
    /// Cluster time in the configured zone
    pub cluster_time: DateTime<Tz>,
    /// `fullDocument` as JSON
    pub full_document: String,
    /// `ns` as JSON
    pub ns: String,
    /// `documentKey` as JSON
    pub document_key: String,
    /// `updateDescription` as JSON
    pub update_description: String,
}

impl ChangeRecord {
    /// Flattens `event`, rendering its cluster time in `zone`.
    pub fn from_event(event: &ChangeEvent, zone: Tz) -> Self {
        let json = |name: &str| event.field_json(name).to_string();
        Self {
            id: json("_id"),
            operation_type: event.operation.as_str().to_string(),
            cluster_time: zone.from_utc_datetime(&event.cluster_datetime().naive_utc()),
            full_document: json("fullDocument"),
            ns: json("ns"),
            document_key: json("documentKey"),
            update_description: json("updateDescription"),
        }
    }

    /// Cluster time formatted with [`CLUSTER_TIME_FORMAT`].
    pub fn cluster_time_text(&self) -> String {
        self.cluster_time.format(CLUSTER_TIME_FORMAT).to_string()
    }

    /// The seven text columns in record order.
    pub fn fields(&self) -> [String; 7] {
        [
            self.id.clone(),
            self.operation_type.clone(),
            self.cluster_time_text(),
            self.full_document.clone(),
            self.ns.clone(),
            self.document_key.clone(),
            self.update_description.clone(),
        ]
    }

    /// Joins the columns with `|`, without a trailing newline.
    pub fn to_pipe_line(&self) -> String {
        self.fields().join(&FIELD_SEPARATOR.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use penne_core::event::{Namespace, OperationType};

    fn event() -> ChangeEvent {
        ChangeEvent::new("00000", OperationType::Insert, Namespace::new("shop", "orders"))
            .with_cluster_time(0, 1)
            .with_document_key(doc! { "_id": "k1" })
            .with_full_document(doc! { "_id": "k1", "sku": "A-1" })
    }

    #[test]
    fn fields_follow_column_order() {
        let fields = ChangeRecord::from_event(&event(), Tz::UTC).fields();
        let json = |i: usize| serde_json::from_str::<serde_json::Value>(&fields[i]).unwrap();

        assert_eq!(fields[0], r#"{"_data":"00000"}"#);
        assert_eq!(fields[1], "insert");
        assert_eq!(fields[2], "1970-01-01 00:00:00");
        assert_eq!(json(3), serde_json::json!({ "_id": "k1", "sku": "A-1" }));
        assert_eq!(json(4), serde_json::json!({ "db": "shop", "coll": "orders" }));
        assert_eq!(fields[5], r#"{"_id":"k1"}"#);
        assert_eq!(fields[6], "null");
    }

    #[test]
    fn cluster_time_uses_configured_zone() {
        let tokyo = parse_time_zone("Asia/Tokyo").unwrap();
        let record = ChangeRecord::from_event(&event(), tokyo);
        assert_eq!(record.cluster_time_text(), "1970-01-01 09:00:00");
    }

    #[test]
    fn pipe_line_has_seven_columns() {
        let line = ChangeRecord::from_event(&event(), Tz::UTC).to_pipe_line();
        assert!(!line.ends_with('\n'));
        assert!(line.starts_with(r#"{"_data":"00000"}|insert|1970-01-01 00:00:00|"#));
        assert!(line.ends_with("|null"));
    }

    #[test]
    fn empty_zone_is_utc_and_unknown_is_rejected() {
        assert_eq!(parse_time_zone("  ").unwrap(), Tz::UTC);
        assert!(parse_time_zone("Mars/Olympus").is_err());
    }
}
