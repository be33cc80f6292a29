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

//! OpenSearch sink.
//!
//! # Modes
//!
//! - **record**: every event is indexed as its own document.
//! - **sync**: the index mirrors the collection. Inserts index the full
//!   document under its `_id`, updates and replaces merge it, deletes
//!   remove it.
//! - **bulkRecord** / **bulkSync**: the same through a
//!   [`BulkIndexBuffer`](penne_core::bulk::BulkIndexBuffer). In bulkSync
//!   inserts are written as upserts, because aggregation may drop the
//!   insert of a document that is updated before the next flush.
//!
//! Database and collection level events (drop, rename, invalidate) are
//! acknowledged without a write.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use penne_sinks::opensearch::{OpenSearchConfig, OpenSearchSink};
//! use std::time::Duration;
//!
//! let config = OpenSearchConfig::builder()
//!     .endpoint("http://localhost:9200")
//!     .index("orders")
//!     .sync(true)
//!     .bulk(true)
//!     .flush_interval(Duration::from_secs(10))
//!     .build()?;
//!
//! let sink = OpenSearchSink::new(config)?;
//! ```

pub mod client;
pub mod config;
mod sink;

pub use client::{DocumentApi, OpenSearchClient};
pub use config::{IndexMode, OpenSearchConfig, OpenSearchConfigBuilder};
pub use sink::OpenSearchSink;

/// Registry name of this sink.
pub const SINK_NAME: &str = "opensearch";
