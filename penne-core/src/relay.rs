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

//! The change stream relay loop.
//!
//! [`ChangeStreamLoop`] drives the read side of the relay:
//!
//! 1. read the stored checkpoint (absent or unreadable means "start from
//!    now")
//! 2. open the change stream, resuming after the checkpoint if there is one
//! 3. for each event: decode, fan out to every sink, and checkpoint the
//!    event if every sink delivered it
//!
//! The loop runs until the cursor ends ([`LoopExit::Exhausted`]), the
//! cancellation token fires ([`LoopExit::Interrupted`]), or a failure stops
//! it with a [`RelayError`]. There is no internal retry; restarting is left
//! to the supervisor, and the checkpoint makes a restart resume where the
//! last fully delivered event left off.
//!
//! # Example
//!
//! ```rust,no_run
//! use penne_core::checkpoint::RateLimitedCheckpointWriter;
//! use penne_core::dispatcher::FanoutDispatcher;
//! use penne_core::relay::ChangeStreamLoop;
//! use penne_core::sink::{MockSink, SinkAdapter};
//! use penne_core::stream::{ChangeStreamConfig, MongoChangeSource};
//! # use penne_core::checkpoint::CheckpointStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(client: mongodb::Client, store: Arc<dyn CheckpointStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let source = MongoChangeSource::new(client, "shop", "orders");
//! let sinks: Vec<Arc<dyn SinkAdapter>> = vec![Arc::new(MockSink::new("mock"))];
//! let writer = RateLimitedCheckpointWriter::new(store, "/data/orders.dat", Duration::from_secs(5));
//!
//! let relay = ChangeStreamLoop::new(
//!     source,
//!     ChangeStreamConfig::default(),
//!     FanoutDispatcher::new(sinks),
//!     Arc::new(writer),
//! );
//! let exit = relay.run(CancellationToken::new()).await?;
//! println!("relay stopped: {exit:?}");
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointError, RateLimitedCheckpointWriter, SaveOutcome};
use crate::dispatcher::{DispatchError, FanoutDispatcher};
use crate::event::{ChangeEvent, ConversionError};
use crate::metrics::{self, RelayStatus};
use crate::stream::{ChangeSource, ChangeStreamConfig, EventStream, StreamError};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop the relay loop.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The change stream could not be opened
    #[error("Failed to open change stream: {0}")]
    Startup(#[source] StreamError),

    /// The cursor reported an error
    #[error("Change stream cursor error: {0}")]
    Cursor(#[source] StreamError),

    /// An event could not be decoded
    #[error("Failed to decode change event: {0}")]
    Decode(#[from] ConversionError),

    /// A sink failed
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The checkpoint could not be written
    #[error("Checkpoint write failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// How the loop stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The cursor ended.
    Exhausted,
    /// The cancellation token fired.
    Interrupted,
}

/// Counters for one run of the loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    events_received: AtomicU64,
    events_checkpointable: AtomicU64,
    checkpoints_written: AtomicU64,
}

impl LoopStats {
    /// Events decoded.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Events every sink delivered.
    pub fn events_checkpointable(&self) -> u64 {
        self.events_checkpointable.load(Ordering::Relaxed)
    }

    /// Checkpoints that reached the store.
    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }
}

/// Reads change events and relays them to every sink.
pub struct ChangeStreamLoop<S> {
    source: S,
    config: ChangeStreamConfig,
    dispatcher: FanoutDispatcher,
    writer: Arc<RateLimitedCheckpointWriter>,
    stats: LoopStats,
}

impl<S: ChangeSource> ChangeStreamLoop<S> {
    /// Creates a loop.
    pub fn new(
        source: S,
        config: ChangeStreamConfig,
        dispatcher: FanoutDispatcher,
        writer: Arc<RateLimitedCheckpointWriter>,
    ) -> Self {
        Self {
            source,
            config,
            dispatcher,
            writer,
            stats: LoopStats::default(),
        }
    }

    /// The dispatcher, e.g. for closing sinks after the loop stopped.
    pub fn dispatcher(&self) -> &FanoutDispatcher {
        &self.dispatcher
    }

    /// Counters accumulated by [`run`](Self::run).
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Runs until the cursor ends, `cancel` fires, or a failure occurs.
    ///
    /// On a clean stop the most recent throttled checkpoint is written.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] describing the stage that failed. The stored
    /// checkpoint never moves past an event that was not delivered by every
    /// sink.
    #[instrument(skip_all, fields(checkpoint_key = %self.writer.key(), sinks = ?self.dispatcher.sink_names()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<LoopExit, RelayError> {
        metrics::set_relay_status(RelayStatus::Running);
        let result = self.run_inner(&cancel).await;

        let result = match result {
            Ok(exit) => match self.writer.flush_pending().await {
                Ok(true) => {
                    debug!("Wrote pending checkpoint on shutdown");
                    Ok(exit)
                }
                Ok(false) => Ok(exit),
                Err(e) => Err(RelayError::Checkpoint(e)),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(exit) => {
                metrics::set_relay_status(RelayStatus::Stopped);
                info!(
                    ?exit,
                    events = self.stats.events_received(),
                    checkpoints = self.stats.checkpoints_written(),
                    "Relay loop stopped"
                );
            }
            Err(e) => {
                metrics::set_relay_status(RelayStatus::Error);
                error!(error = %e, "Relay loop failed");
            }
        }
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<LoopExit, RelayError> {
        let checkpoint = self.writer.load().await;
        match &checkpoint {
            Some(token) => info!(checkpoint = %token, "Resuming change stream after stored checkpoint"),
            None => info!("Watching change stream from the current position"),
        }

        let request = self
            .config
            .watch_request(checkpoint.as_deref())
            .map_err(RelayError::Startup)?;
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LoopExit::Interrupted),
            opened = self.source.watch(&request) => opened.map_err(RelayError::Startup)?,
        };

        self.consume(&mut stream, cancel).await
    }

    async fn consume(
        &self,
        stream: &mut EventStream,
        cancel: &CancellationToken,
    ) -> Result<LoopExit, RelayError> {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(LoopExit::Interrupted);
                }
                next = stream.next() => next,
            };

            let raw = match next {
                None => {
                    warn!("Change stream cursor exhausted");
                    return Ok(LoopExit::Exhausted);
                }
                Some(Err(e)) => {
                    error!(retryable = e.is_retryable(), error_type = e.error_type(), error = %e, "Change stream error");
                    return Err(RelayError::Cursor(e));
                }
                Some(Ok(raw)) => raw,
            };

            let event = Arc::new(ChangeEvent::from_document(raw)?);
            self.stats.events_received.fetch_add(1, Ordering::Relaxed);
            metrics::increment_events_received(event.collection_name(), event.operation.as_str());
            info!(
                database = %event.database_name(),
                collection = %event.collection_name(),
                operation = %event.operation,
                cluster_time = %event.cluster_datetime(),
                "Received change event"
            );

            let outcome = match self.dispatcher.dispatch(&event, cancel).await {
                Ok(outcome) => outcome,
                Err(DispatchError::Cancelled) => {
                    info!("Shutdown requested during dispatch");
                    return Ok(LoopExit::Interrupted);
                }
                Err(e) => return Err(e.into()),
            };

            if !outcome.is_checkpointable() {
                debug!(buffered = ?outcome.buffered_sinks(), "Event buffered, checkpoint not advanced");
                continue;
            }

            self.stats.events_checkpointable.fetch_add(1, Ordering::Relaxed);
            if self.writer.maybe_save(event.checkpoint()).await? == SaveOutcome::Written {
                self.stats.checkpoints_written.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::sink::{MockSink, SinkAdapter};
    use async_trait::async_trait;
    use bson::{doc, Document, Timestamp};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Store {
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CheckpointStore for Store {
        async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
            Err(CheckpointError::NotFound(key.to_string()))
        }
        async fn put(&self, _key: &str, value: &[u8]) -> Result<(), CheckpointError> {
            self.puts
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(value).into_owned());
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<(), CheckpointError> {
            Ok(())
        }
        fn backend(&self) -> &'static str {
            "test"
        }
    }

    struct Scripted(Mutex<Option<Vec<Result<Document, StreamError>>>>);

    #[async_trait]
    impl ChangeSource for Scripted {
        async fn watch(&self, _request: &crate::stream::WatchRequest) -> Result<EventStream, StreamError> {
            let items = self.0.lock().unwrap().take().unwrap_or_default();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    fn raw(token: &str) -> Document {
        doc! {
            "_id": { "_data": token },
            "operationType": "insert",
            "clusterTime": Timestamp { time: 1, increment: 1 },
            "ns": { "db": "db", "coll": "c" },
            "documentKey": { "_id": 1 },
        }
    }

    fn relay(
        items: Vec<Result<Document, StreamError>>,
        sinks: Vec<Arc<dyn SinkAdapter>>,
        store: &Arc<Store>,
    ) -> ChangeStreamLoop<Scripted> {
        let writer = RateLimitedCheckpointWriter::new(
            Arc::clone(store) as Arc<dyn CheckpointStore>,
            "c.dat",
            Duration::ZERO,
        );
        ChangeStreamLoop::new(
            Scripted(Mutex::new(Some(items))),
            ChangeStreamConfig::default(),
            FanoutDispatcher::new(sinks),
            Arc::new(writer),
        )
    }

    #[tokio::test]
    async fn decode_error_is_fatal() {
        let store = Arc::new(Store::default());
        let relay = relay(
            vec![Ok(doc! { "operationType": "insert" })],
            vec![Arc::new(MockSink::new("a")) as Arc<dyn SinkAdapter>],
            &store,
        );
        let result = relay.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(RelayError::Decode(_))));
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_error_is_fatal() {
        let store = Arc::new(Store::default());
        let relay = relay(
            vec![
                Ok(raw("a")),
                Err(StreamError::Configuration("boom".to_string())),
            ],
            vec![Arc::new(MockSink::new("a")) as Arc<dyn SinkAdapter>],
            &store,
        );
        let result = relay.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(RelayError::Cursor(_))));
        assert_eq!(*store.puts.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_is_interrupted() {
        let store = Arc::new(Store::default());
        let relay = relay(vec![Ok(raw("a"))], vec![Arc::new(MockSink::new("a")) as Arc<dyn SinkAdapter>], &store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(relay.run(cancel).await.unwrap(), LoopExit::Interrupted);
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_track_progress() {
        let store = Arc::new(Store::default());
        let relay = relay(
            vec![Ok(raw("a")), Ok(raw("b"))],
            vec![Arc::new(MockSink::new("a")) as Arc<dyn SinkAdapter>],
            &store,
        );
        assert_eq!(relay.run(CancellationToken::new()).await.unwrap(), LoopExit::Exhausted);
        assert_eq!(relay.stats().events_received(), 2);
        assert_eq!(relay.stats().checkpoints_written(), 2);
    }
}
