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

//! OpenSearch sink configuration.

use penne_core::bulk::{BulkIndexConfig, DEFAULT_FLUSH_BYTES};
use std::time::Duration;

/// How events are written to the index.
///
/// Chosen by the `sync` and `bulk` switches:
///
/// | sync | bulk | mode |
/// |------|------|------|
/// | off | off | [`IndexMode::Record`] |
/// | on | off | [`IndexMode::Sync`] |
/// | off | on | [`IndexMode::BulkRecord`] |
/// | on | on | [`IndexMode::BulkSync`] |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Every event is indexed as a new document with a generated id.
    Record,
    /// The index mirrors the collection: one document per `_id`.
    Sync,
    /// Like `Record`, through the bulk buffer.
    BulkRecord,
    /// Like `Sync`, through the bulk buffer with upserts.
    BulkSync,
}

impl IndexMode {
    /// Maps the two switches to a mode.
    #[must_use]
    pub const fn from_flags(sync: bool, bulk: bool) -> Self {
        match (sync, bulk) {
            (false, false) => Self::Record,
            (true, false) => Self::Sync,
            (false, true) => Self::BulkRecord,
            (true, true) => Self::BulkSync,
        }
    }

    /// Returns true for the buffered modes.
    #[must_use]
    pub const fn is_bulk(self) -> bool {
        matches!(self, Self::BulkRecord | Self::BulkSync)
    }

    /// Returns the mode name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Sync => "sync",
            Self::BulkRecord => "bulkRecord",
            Self::BulkSync => "bulkSync",
        }
    }
}

/// Configuration for [`OpenSearchSink`](super::OpenSearchSink).
///
/// # Examples
///
/// ```rust
/// use penne_sinks::opensearch::{IndexMode, OpenSearchConfig};
///
/// let config = OpenSearchConfig::builder()
///     .endpoint("http://localhost:9200")
///     .index("orders")
///     .sync(true)
///     .bulk(true)
///     .flush_bytes(1_000_000)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.mode, IndexMode::BulkSync);
/// ```
#[derive(Debug, Clone)]
pub struct OpenSearchConfig {
    /// Base URL of the cluster, without a trailing slash
    pub endpoint: String,

    /// Target index
    pub index: String,

    /// Write mode
    pub mode: IndexMode,

    /// Bulk buffer settings; only used by the bulk modes
    pub bulk: BulkIndexConfig,

    /// Background flush period for the bulk modes; `None` flushes only on
    /// size and on close
    pub flush_interval: Option<Duration>,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl OpenSearchConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> OpenSearchConfigBuilder {
        OpenSearchConfigBuilder::default()
    }
}

/// Builder for [`OpenSearchConfig`].
#[derive(Debug, Default)]
pub struct OpenSearchConfigBuilder {
    endpoint: Option<String>,
    index: Option<String>,
    sync: bool,
    bulk: bool,
    flush_bytes: Option<usize>,
    flush_interval: Option<Duration>,
    aggregation: bool,
    request_timeout: Option<Duration>,
}

impl OpenSearchConfigBuilder {
    /// Sets the cluster URL (required).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the target index (required).
    #[must_use]
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Mirrors documents by `_id` instead of recording every event.
    #[must_use]
    pub fn sync(mut self, enabled: bool) -> Self {
        self.sync = enabled;
        self
    }

    /// Routes writes through the bulk buffer.
    #[must_use]
    pub fn bulk(mut self, enabled: bool) -> Self {
        self.bulk = enabled;
        self
    }

    /// Sets the bulk flush threshold. Zero keeps the default.
    #[must_use]
    pub fn flush_bytes(mut self, bytes: usize) -> Self {
        self.flush_bytes = Some(bytes).filter(|b| *b > 0);
        self
    }

    /// Sets the background flush period. Zero disables it.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    /// Enables per-document aggregation in the bulk buffer.
    #[must_use]
    pub fn aggregation(mut self, enabled: bool) -> Self {
        self.aggregation = enabled;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint or index is missing, or the endpoint
    /// is not an http(s) URL.
    pub fn build(self) -> Result<OpenSearchConfig, String> {
        let endpoint = self
            .endpoint
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| "endpoint is required".to_string())?;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(format!("endpoint must be an http(s) URL, got {endpoint}"));
        }

        let index = self
            .index
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .ok_or_else(|| "index is required".to_string())?;

        let bulk = BulkIndexConfig::builder()
            .flush_bytes(self.flush_bytes.unwrap_or(DEFAULT_FLUSH_BYTES))
            .aggregation(self.aggregation)
            .label(super::SINK_NAME)
            .build()?;

        Ok(OpenSearchConfig {
            endpoint,
            index,
            mode: IndexMode::from_flags(self.sync, self.bulk),
            bulk,
            flush_interval: self.flush_interval,
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_switches() {
        assert_eq!(IndexMode::from_flags(false, false), IndexMode::Record);
        assert_eq!(IndexMode::from_flags(true, false), IndexMode::Sync);
        assert_eq!(IndexMode::from_flags(false, true), IndexMode::BulkRecord);
        assert_eq!(IndexMode::from_flags(true, true), IndexMode::BulkSync);
        assert!(IndexMode::BulkRecord.is_bulk());
        assert!(!IndexMode::Sync.is_bulk());
    }

    #[test]
    fn defaults_apply() {
        let config = OpenSearchConfig::builder()
            .endpoint("https://search.internal:9200/")
            .index("orders")
            .flush_bytes(0)
            .flush_interval(Duration::ZERO)
            .build()
            .unwrap();

        assert_eq!(config.endpoint, "https://search.internal:9200");
        assert_eq!(config.mode, IndexMode::Record);
        assert_eq!(config.bulk.flush_bytes, DEFAULT_FLUSH_BYTES);
        assert!(!config.bulk.aggregation);
        assert_eq!(config.flush_interval, None);
    }

    #[test]
    fn required_fields() {
        assert!(OpenSearchConfig::builder().index("orders").build().is_err());
        assert!(OpenSearchConfig::builder().endpoint("http://x").build().is_err());
        assert!(OpenSearchConfig::builder()
            .endpoint("localhost:9200")
            .index("orders")
            .build()
            .is_err());
    }
}
