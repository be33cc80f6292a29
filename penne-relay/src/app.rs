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

//! Wiring of configuration, checkpoint store, sinks and the relay loop.

use crate::config::RelayConfig;
use crate::registry::{self, RegistryError};
use penne_core::checkpoint::{CheckpointStore, RateLimitedCheckpointWriter};
use penne_core::dispatcher::FanoutDispatcher;
use penne_core::relay::{ChangeStreamLoop, LoopExit, RelayError};
use penne_core::stream::{parse_field_list, ChangeSource, ChangeStreamConfig, StreamError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Failures of the relay process.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration or component construction failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The change stream settings were rejected.
    #[error("invalid change stream settings: {0}")]
    Stream(#[from] StreamError),

    /// The relay loop stopped with an error.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Everything the relay loop needs apart from the change source.
pub struct RelayComponents {
    /// Checkpoint writer bound to this collection's key.
    pub writer: Arc<RateLimitedCheckpointWriter>,
    /// Dispatcher over every configured sink.
    pub dispatcher: FanoutDispatcher,
    /// Change stream settings.
    pub stream: ChangeStreamConfig,
}

impl RelayComponents {
    /// Builds the configured store and sinks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] for invalid settings or sinks that fail to start.
    pub async fn assemble(config: &RelayConfig) -> Result<Self, AppError> {
        let store = registry::build_store(&config.checkpoint).await?;
        Self::assemble_with_store(config, store).await
    }

    /// Builds the sinks around an existing checkpoint store.
    ///
    /// # Errors
    ///
    /// See [`assemble`](Self::assemble).
    pub async fn assemble_with_store(
        config: &RelayConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, AppError> {
        let stream = ChangeStreamConfig::builder()
            .exclude_full_document_fields(parse_field_list(&config.namespace.exclude_full_document_fields))
            .build()?;

        let key = registry::checkpoint_key_for(&config.checkpoint, &config.namespace.collection);
        let interval = config.checkpoint.save_interval();
        info!(
            checkpoint_key = %key,
            backend = store.backend(),
            save_interval_secs = interval.as_secs(),
            "Checkpoint store ready"
        );
        let writer = Arc::new(RateLimitedCheckpointWriter::new(store, key, interval));

        let sinks = registry::build_sinks(config).await?;
        Ok(Self {
            writer,
            dispatcher: FanoutDispatcher::new(sinks),
            stream,
        })
    }

    /// Runs the relay over `source` until it stops, then closes every sink.
    ///
    /// Sink close failures are logged; the loop result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Relay`] when the loop fails.
    pub async fn run<S: ChangeSource>(self, source: S, cancel: CancellationToken) -> Result<LoopExit, AppError> {
        let relay = ChangeStreamLoop::new(source, self.stream, self.dispatcher, self.writer);
        let result = relay.run(cancel).await;

        if let Err(e) = relay.dispatcher().close().await {
            warn!(error = %e, "Failed to close sinks cleanly");
        }

        Ok(result?)
    }
}
