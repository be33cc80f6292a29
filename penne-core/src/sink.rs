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

//! Sink trait and error types.
//!
//! A sink is one downstream consumer of change events: a search index, a
//! stream, a topic, a table, a log file. The [`SinkAdapter`] contract is
//! deliberately small:
//!
//! - [`SinkAdapter::deliver`] hands over one event and reports whether the
//!   event is now durable downstream ([`Delivery::Delivered`]) or only
//!   accepted into an in-memory buffer ([`Delivery::Buffered`]).
//! - An `Err` means the event was neither delivered nor buffered.
//! - [`SinkAdapter::close`] releases clients and flushes what can be flushed.
//!
//! # Delivery and checkpoints
//!
//! The relay advances its checkpoint only when every configured sink
//! returned [`Delivery::Delivered`] for the event. A sink that buffers must
//! therefore report `Buffered`, and that event is redelivered after a
//! restart. Events are never lost this way; duplicates are possible.
//!
//! # Implementing a sink
//!
//! ```rust
//! use penne_core::event::ChangeEvent;
//! use penne_core::sink::{Delivery, SinkAdapter, SinkError};
//! use async_trait::async_trait;
//!
//! struct Discard;
//!
//! #[async_trait]
//! impl SinkAdapter for Discard {
//!     fn name(&self) -> &str {
//!         "discard"
//!     }
//!
//!     async fn deliver(&self, _event: &ChangeEvent) -> Result<Delivery, SinkError> {
//!         Ok(Delivery::Delivered)
//!     }
//! }
//! ```
//!
//! Sinks are shared across concurrently running dispatch tasks, so `deliver`
//! takes `&self`; sinks with internal state guard it themselves.

use crate::event::ChangeEvent;
use crate::metrics::ErrorCategory;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Result of a successful [`SinkAdapter::deliver`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// The event is durably accepted by the downstream system.
    Delivered,
    /// The event is held in a local buffer and not yet durable.
    Buffered,
}

impl Delivery {
    /// Returns true for [`Delivery::Delivered`].
    #[inline]
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Buffered => "buffered",
        }
    }
}

/// Errors a sink can report for a single delivery.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connection to the downstream system failed.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Human-readable error message
        message: String,
        /// The underlying connection error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The event could not be encoded for the downstream system.
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Human-readable error message
        message: String,
        /// The underlying serialization error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The downstream system rejected or failed the write.
    #[error("Write error: {message}")]
    WriteError {
        /// Human-readable error message
        message: String,
        /// Whether a retry might succeed
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid sink configuration.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Human-readable error message
        message: String,
        /// Configuration parameter name if applicable
        parameter: Option<String>,
    },

    /// The delivery was abandoned because its dispatch group was cancelled.
    #[error("Delivery cancelled")]
    Cancelled,
}

impl SinkError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::ConnectionError {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(
        source: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(source: impl std::error::Error + Send + Sync + 'static, retryable: bool) -> Self {
        Self::WriteError {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::WriteError {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
            parameter,
        }
    }

    /// Returns whether a supervisor restarting the relay could expect this
    /// error to clear.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { .. } | Self::Cancelled => true,
            Self::SerializationError { .. } | Self::ConfigurationError { .. } => false,
            Self::WriteError { retryable, .. } => *retryable,
        }
    }

    /// Returns the metrics category for this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionError { .. } => ErrorCategory::Connection,
            Self::SerializationError { .. } => ErrorCategory::Serialization,
            Self::WriteError { .. } => ErrorCategory::Write,
            Self::ConfigurationError { .. } => ErrorCategory::Configuration,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

/// The contract every downstream sink implements.
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// dispatch task for the lifetime of the relay.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Short identifier used in logs, metrics and errors (e.g. "opensearch").
    fn name(&self) -> &str;

    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the event was neither delivered nor
    /// buffered. The relay treats any error as fatal for the current run.
    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError>;

    /// Releases resources and flushes any buffered data.
    ///
    /// Called once when the relay stops. The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if buffered data could not be flushed.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockBehavior {
    Deliver,
    Buffer,
    Fail,
}

/// A scriptable in-memory sink for tests and benchmarks.
///
/// ```rust
/// use penne_core::sink::MockSink;
/// use std::time::Duration;
///
/// let sink = MockSink::new("search")
///     .with_delay(Duration::from_millis(5))
///     .fail_on("token-3");
/// assert_eq!(sink.deliver_count(), 0);
/// ```
#[derive(Debug)]
pub struct MockSink {
    name: String,
    behavior: MockBehavior,
    delay: Option<Duration>,
    fail_on: Option<String>,
    delivered: Mutex<Vec<ChangeEvent>>,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

impl MockSink {
    /// Creates a sink that reports every event as delivered.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: MockBehavior::Deliver,
            delay: None,
            fail_on: None,
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Reports every event as buffered.
    #[must_use]
    pub fn buffering(mut self) -> Self {
        self.behavior = MockBehavior::Buffer;
        self
    }

    /// Fails every delivery with a retryable write error.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.behavior = MockBehavior::Fail;
        self
    }

    /// Fails only the event whose checkpoint equals `checkpoint`.
    #[must_use]
    pub fn fail_on(mut self, checkpoint: impl Into<String>) -> Self {
        self.fail_on = Some(checkpoint.into());
        self
    }

    /// Sleeps before answering each delivery.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `deliver` calls that started.
    #[must_use]
    pub fn deliver_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Events that completed delivery (delivered or buffered), in order.
    #[must_use]
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.delivered
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Checkpoints of the events returned by [`MockSink::events`].
    #[must_use]
    pub fn checkpoints(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.checkpoint().to_string())
            .collect()
    }
}

#[async_trait]
impl SinkAdapter for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail_this = self.fail_on.as_deref() == Some(event.checkpoint());
        let delivery = match self.behavior {
            MockBehavior::Fail => return Err(SinkError::write_msg("mock sink failure", true)),
            _ if fail_this => return Err(SinkError::write_msg("mock sink failure", true)),
            MockBehavior::Deliver => Delivery::Delivered,
            MockBehavior::Buffer => Delivery::Buffered,
        };

        if let Ok(mut events) = self.delivered.lock() {
            events.push(event.clone());
        }
        Ok(delivery)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Namespace, OperationType};

    fn event(token: &str) -> ChangeEvent {
        ChangeEvent::new(token, OperationType::Insert, Namespace::new("db", "coll"))
    }

    #[test]
    fn retryability() {
        assert!(SinkError::connection_msg("refused").is_retryable());
        assert!(!SinkError::configuration("bad", None).is_retryable());
        assert!(SinkError::write_msg("throttled", true).is_retryable());
        assert!(!SinkError::write_msg("forbidden", false).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SinkError::write_msg("quota exceeded", true);
        assert_eq!(err.to_string(), "Write error: quota exceeded");
        assert_eq!(err.category(), ErrorCategory::Write);
    }

    #[tokio::test]
    async fn mock_sink_modes() {
        let ok = MockSink::new("ok");
        assert_eq!(ok.deliver(&event("a")).await.unwrap(), Delivery::Delivered);

        let buffering = MockSink::new("buf").buffering();
        assert_eq!(buffering.deliver(&event("a")).await.unwrap(), Delivery::Buffered);

        let selective = MockSink::new("sel").fail_on("b");
        assert!(selective.deliver(&event("a")).await.is_ok());
        assert!(selective.deliver(&event("b")).await.is_err());
        assert_eq!(selective.checkpoints(), vec!["a".to_string()]);
        assert_eq!(selective.deliver_count(), 2);
    }
}
