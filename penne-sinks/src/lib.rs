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

//! Sink adapters for the Penne change-stream relay.
//!
//! Every adapter implements [`SinkAdapter`](penne_core::sink::SinkAdapter)
//! and reports [`Delivery::Delivered`](penne_core::sink::Delivery) only once
//! the event is durable downstream.
//!
//! # Available Sinks
//!
//! | Name | Type | Feature |
//! |------|------|---------|
//! | `file` | [`file::FileSink`] | always |
//! | `opensearch` | `opensearch::OpenSearchSink` | `opensearch` (default) |
//! | `elasticsearch` | `elasticsearch::ElasticsearchSink` | `elasticsearch` |
//! | `kinesisStream` | `kinesis::KinesisSink` | `kinesis` |
//! | `pubsub` | `pubsub::PubSubSink` | `pubsub` |
//! | `bigquery` | `bigquery::BigQuerySink` | `bigquery` |
//!
//! The last three share the pipe-delimited encoding in [`record`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use penne_sinks::file::{FileSink, FileSinkConfig};
//!
//! let sink = FileSink::stdout(FileSinkConfig::default());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod file;
pub mod record;

#[cfg(feature = "opensearch")]
pub mod opensearch;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

#[cfg(feature = "kinesis")]
pub mod kinesis;

#[cfg(feature = "pubsub")]
pub mod pubsub;

#[cfg(feature = "bigquery")]
pub mod bigquery;
