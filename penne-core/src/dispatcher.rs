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

//! Concurrent fan-out of one event to every sink.
//!
//! Each dispatch runs one task per sink inside a `JoinSet` that is scoped to
//! the event: all tasks are joined before [`FanoutDispatcher::dispatch`]
//! returns. The first failing sink cancels its siblings through a child
//! [`CancellationToken`], and cancelling the parent token abandons the
//! whole dispatch.

use crate::event::ChangeEvent;
use crate::metrics;
use crate::sink::{Delivery, SinkAdapter, SinkError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Why a dispatch did not complete.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A sink returned an error.
    #[error("sink `{sink}` failed: {source}")]
    Sink {
        /// Name of the failing sink
        sink: String,
        /// The sink's error
        #[source]
        source: SinkError,
    },

    /// The dispatch was cancelled from outside before every sink answered.
    #[error("dispatch cancelled")]
    Cancelled,

    /// A sink task panicked.
    #[error("sink task panicked: {0}")]
    Panicked(String),
}

/// Per-sink results of a completed dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    deliveries: Vec<(String, Delivery)>,
}

impl DispatchOutcome {
    /// True when every sink reported [`Delivery::Delivered`].
    #[must_use]
    pub fn is_checkpointable(&self) -> bool {
        self.deliveries.iter().all(|(_, d)| d.is_delivered())
    }

    /// Names of sinks that only buffered the event.
    #[must_use]
    pub fn buffered_sinks(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .filter(|(_, d)| !d.is_delivered())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Per-sink deliveries in configuration order.
    #[must_use]
    pub fn deliveries(&self) -> &[(String, Delivery)] {
        &self.deliveries
    }
}

/// Sends each event to every configured sink concurrently.
pub struct FanoutDispatcher {
    sinks: Vec<Arc<dyn SinkAdapter>>,
}

impl FanoutDispatcher {
    /// Creates a dispatcher over `sinks`.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn SinkAdapter>>) -> Self {
        Self { sinks }
    }

    /// Configured sink names, in order.
    #[must_use]
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Delivers `event` to all sinks and waits for every one of them.
    ///
    /// With no sinks configured the outcome is vacuously checkpointable.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Sink`] for the first sink that failed; the others
    ///   were cancelled.
    /// - [`DispatchError::Cancelled`] if `cancel` fired first.
    #[instrument(skip_all, fields(checkpoint = %event.checkpoint(), operation = %event.operation))]
    pub async fn dispatch(
        &self,
        event: &Arc<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let group = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (idx, sink) in self.sinks.iter().enumerate() {
            let sink = Arc::clone(sink);
            let event = Arc::clone(event);
            let token = group.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => Err(SinkError::Cancelled),
                    result = sink.deliver(&event) => result,
                };
                metrics::record_sink_deliver_duration(started.elapsed(), sink.name());
                (idx, result)
            });
        }

        let mut deliveries: Vec<Option<Delivery>> = vec![None; self.sinks.len()];
        let mut first_error: Option<DispatchError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(delivery))) => {
                    debug!(sink = self.sinks[idx].name(), delivery = delivery.as_str(), "Sink answered");
                    deliveries[idx] = Some(delivery);
                }
                Ok((idx, Err(err))) => {
                    if first_error.is_some() {
                        continue;
                    }
                    group.cancel();
                    let name = self.sinks[idx].name().to_string();
                    if matches!(err, SinkError::Cancelled) && cancel.is_cancelled() {
                        debug!(sink = %name, "Delivery cancelled");
                        first_error = Some(DispatchError::Cancelled);
                    } else {
                        metrics::increment_sink_errors(&name, err.category());
                        error!(sink = %name, retryable = err.is_retryable(), error = %err, "Sink delivery failed");
                        first_error = Some(DispatchError::Sink { sink: name, source: err });
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        group.cancel();
                        warn!(error = %join_err, "Sink task did not complete");
                        first_error = Some(DispatchError::Panicked(join_err.to_string()));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let deliveries: Vec<(String, Delivery)> = self
            .sinks
            .iter()
            .zip(deliveries)
            .filter_map(|(sink, d)| d.map(|d| (sink.name().to_string(), d)))
            .collect();
        let outcome = DispatchOutcome { deliveries };
        let label = if outcome.is_checkpointable() {
            Delivery::Delivered.as_str()
        } else {
            Delivery::Buffered.as_str()
        };
        metrics::increment_events_dispatched(event.collection_name(), label);
        Ok(outcome)
    }

    /// Closes every sink, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns the first close error after all sinks were closed.
    pub async fn close(&self) -> Result<(), DispatchError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                error!(sink = sink.name(), error = %e, "Failed to close sink");
                if first_error.is_none() {
                    first_error = Some(DispatchError::Sink {
                        sink: sink.name().to_string(),
                        source: e,
                    });
                }
            } else {
                debug!(sink = sink.name(), "Sink closed");
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
