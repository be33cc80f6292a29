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

use anyhow::Context;
use clap::Parser;
use penne_core::relay::LoopExit;
use penne_core::stream::MongoChangeSource;
use penne_relay::{logging, RelayComponents, RelayConfig};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = RelayConfig::parse();

    if let Err(e) = logging::init(&config.log) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    penne_core::metrics::init_metrics();

    match run(config).await {
        Ok(exit) => {
            info!(?exit, "Relay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "Relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: RelayConfig) -> anyhow::Result<LoopExit> {
    info!(
        database = %config.namespace.database,
        collection = %config.namespace.collection,
        destinations = %config.sinks.export_destination,
        "Starting penne"
    );

    let components = RelayComponents::assemble(&config)
        .await
        .context("failed to build relay components")?;

    let client = mongodb::Client::with_uri_str(&config.mongo.host)
        .await
        .context("failed to create MongoDB client")?;
    let source = MongoChangeSource::new(
        client,
        config.namespace.database.clone(),
        config.namespace.collection.clone(),
    );
    source
        .verify_namespace()
        .await
        .context("failed to look up the watched collection")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    Ok(components.run(source, cancel).await?)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }

    cancel.cancel();
}
