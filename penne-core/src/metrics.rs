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

//! Metrics instrumentation for the relay.
//!
//! Uses the `metrics` facade, so any exporter (Prometheus, StatsD, ...) can
//! be installed by the host binary. When no recorder is installed every
//! call below is a no-op.
//!
//! # Naming
//!
//! All metrics are prefixed with `penne_`, use underscores, carry a unit
//! suffix (`_seconds`, `_bytes`) and counters end in `_total`.
//!
//! # Labels
//!
//! - **collection**: watched collection name
//! - **operation**: change operation type
//! - **sink**: sink name such as "opensearch" or "kinesis"
//! - **backend**: checkpoint store backend ("file", "s3", "gcs", "memory")
//! - **error_type**: an [`ErrorCategory`]
//!
//! Never label with resume tokens, document ids or error messages.
//!
//! # Examples
//!
//! ```rust
//! use penne_core::metrics::{self, ErrorCategory};
//!
//! metrics::increment_events_received("orders", "insert");
//! metrics::increment_sink_errors("opensearch", ErrorCategory::Connection);
//! metrics::set_buffered_bytes(4096, "opensearch");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

#[doc(hidden)]
pub const METRIC_PREFIX: &str = "penne";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Change events read from the cursor and decoded.
///
/// Type: Counter
/// Labels: collection, operation
#[doc(hidden)]
pub const EVENTS_RECEIVED_TOTAL: &str = "penne_events_received_total";

/// Events whose fan-out completed, by overall outcome.
///
/// Type: Counter
/// Labels: collection, outcome ("delivered" or "buffered")
#[doc(hidden)]
pub const EVENTS_DISPATCHED_TOTAL: &str = "penne_events_dispatched_total";

/// Sink delivery failures.
///
/// Type: Counter
/// Labels: sink, error_type
#[doc(hidden)]
pub const SINK_ERRORS_TOTAL: &str = "penne_sink_errors_total";

/// Time spent in a single `deliver` call.
///
/// Type: Histogram
/// Labels: sink
#[doc(hidden)]
pub const SINK_DELIVER_DURATION_SECONDS: &str = "penne_sink_deliver_duration_seconds";

/// Checkpoints physically written.
///
/// Type: Counter
/// Labels: backend
#[doc(hidden)]
pub const CHECKPOINT_WRITES_TOTAL: &str = "penne_checkpoint_writes_total";

/// Checkpoints skipped by the rate limiter.
///
/// Type: Counter
#[doc(hidden)]
pub const CHECKPOINT_THROTTLED_TOTAL: &str = "penne_checkpoint_throttled_total";

/// Failed checkpoint writes.
///
/// Type: Counter
/// Labels: backend
#[doc(hidden)]
pub const CHECKPOINT_WRITE_ERRORS_TOTAL: &str = "penne_checkpoint_write_errors_total";

/// Successful bulk flushes.
///
/// Type: Counter
/// Labels: sink
#[doc(hidden)]
pub const BULK_FLUSHES_TOTAL: &str = "penne_bulk_flushes_total";

/// Failed bulk flushes (buffer retained).
///
/// Type: Counter
/// Labels: sink
#[doc(hidden)]
pub const BULK_FLUSH_FAILURES_TOTAL: &str = "penne_bulk_flush_failures_total";

/// Payload size of each bulk flush.
///
/// Type: Histogram
/// Labels: sink
#[doc(hidden)]
pub const BULK_FLUSH_BYTES: &str = "penne_bulk_flush_bytes";

/// Bytes currently held in a bulk buffer.
///
/// Type: Gauge
/// Labels: sink
#[doc(hidden)]
pub const BULK_BUFFERED_BYTES: &str = "penne_bulk_buffered_bytes";

/// Relay status, see [`RelayStatus`].
///
/// Type: Gauge
#[doc(hidden)]
pub const RELAY_STATUS: &str = "penne_relay_status";

// ============================================================================
// Initialization
// ============================================================================

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder. Safe to skip entirely.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Change events read from the change stream"
    );
    describe_counter!(
        EVENTS_DISPATCHED_TOTAL,
        "Change events fanned out to every sink, by outcome"
    );
    describe_counter!(SINK_ERRORS_TOTAL, "Sink delivery failures by error type");
    describe_histogram!(
        SINK_DELIVER_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of a single sink delivery"
    );
    describe_counter!(CHECKPOINT_WRITES_TOTAL, "Checkpoints written to the store");
    describe_counter!(
        CHECKPOINT_THROTTLED_TOTAL,
        "Checkpoints skipped by the write rate limiter"
    );
    describe_counter!(
        CHECKPOINT_WRITE_ERRORS_TOTAL,
        "Checkpoint writes that failed"
    );
    describe_counter!(BULK_FLUSHES_TOTAL, "Successful bulk flushes");
    describe_counter!(
        BULK_FLUSH_FAILURES_TOTAL,
        "Bulk flushes that failed and kept their buffer"
    );
    describe_histogram!(
        BULK_FLUSH_BYTES,
        metrics::Unit::Bytes,
        "Payload size of each bulk flush"
    );
    describe_gauge!(
        BULK_BUFFERED_BYTES,
        metrics::Unit::Bytes,
        "Bytes currently held in a bulk buffer"
    );
    describe_gauge!(
        RELAY_STATUS,
        "Relay status (0=stopped, 1=running, 2=error)"
    );
}

// ============================================================================
// Recording Functions
// ============================================================================

/// Counts one decoded change event.
pub fn increment_events_received(collection: &str, operation: &str) {
    counter!(EVENTS_RECEIVED_TOTAL, "collection" => collection.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Counts one completed fan-out.
pub fn increment_events_dispatched(collection: &str, outcome: &'static str) {
    counter!(EVENTS_DISPATCHED_TOTAL, "collection" => collection.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Counts one failed sink delivery.
pub fn increment_sink_errors(sink: &str, error_category: ErrorCategory) {
    counter!(SINK_ERRORS_TOTAL, "sink" => sink.to_string(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Records how long one delivery took.
pub fn record_sink_deliver_duration(duration: Duration, sink: &str) {
    histogram!(SINK_DELIVER_DURATION_SECONDS, "sink" => sink.to_string())
        .record(duration.as_secs_f64());
}

/// Counts one physical checkpoint write.
pub fn increment_checkpoint_writes(backend: &'static str) {
    counter!(CHECKPOINT_WRITES_TOTAL, "backend" => backend).increment(1);
}

/// Counts one checkpoint skipped by the rate limiter.
pub fn increment_checkpoint_throttled() {
    counter!(CHECKPOINT_THROTTLED_TOTAL).increment(1);
}

/// Counts one failed checkpoint write.
pub fn increment_checkpoint_write_errors(backend: &'static str) {
    counter!(CHECKPOINT_WRITE_ERRORS_TOTAL, "backend" => backend).increment(1);
}

/// Records a successful bulk flush of `bytes`.
pub fn record_bulk_flush(bytes: usize, sink: &str) {
    counter!(BULK_FLUSHES_TOTAL, "sink" => sink.to_string()).increment(1);
    #[allow(clippy::cast_precision_loss)]
    histogram!(BULK_FLUSH_BYTES, "sink" => sink.to_string()).record(bytes as f64);
}

/// Counts a failed bulk flush.
pub fn increment_bulk_flush_failures(sink: &str) {
    counter!(BULK_FLUSH_FAILURES_TOTAL, "sink" => sink.to_string()).increment(1);
}

/// Sets the number of bytes held in a bulk buffer.
pub fn set_buffered_bytes(bytes: usize, sink: &str) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(BULK_BUFFERED_BYTES, "sink" => sink.to_string()).set(bytes as f64);
}

/// Sets the relay status gauge.
pub fn set_relay_status(status: RelayStatus) {
    gauge!(RELAY_STATUS).set(f64::from(status as u8));
}

// ============================================================================
// Label Types
// ============================================================================

/// Relay status for the `relay_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayStatus {
    /// Relay is stopped.
    Stopped = 0,
    /// Relay is consuming the change stream.
    Running = 1,
    /// Relay stopped on an error.
    Error = 2,
}

/// Error categories for consistent metric labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network, TCP, DNS or TLS failures
    Connection,
    /// Encoding failures
    Serialization,
    /// Downstream write rejected or failed
    Write,
    /// Invalid configuration
    Configuration,
    /// Delivery abandoned by cancellation
    Cancelled,
    /// Unclassified
    Unknown,
}

impl ErrorCategory {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection_error",
            Self::Serialization => "serialization_error",
            Self::Write => "write_error",
            Self::Configuration => "configuration_error",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown_error",
        }
    }
}

// ============================================================================
// Metric Helper Utilities
// ============================================================================

/// Records the elapsed time through `record_fn` when dropped.
///
/// ```rust
/// use penne_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("opensearch", metrics::record_sink_deliver_duration);
///     // ... deliver ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}
