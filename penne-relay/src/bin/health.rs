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

//! Liveness check: pings the primary of the configured deployment.

use bson::doc;
use clap::Parser;
use mongodb::options::{ReadPreference, SelectionCriteria};
use penne_relay::{logging, HealthConfig};
use std::process::ExitCode;
use tracing::error;

/// Exit code when the primary cannot be reached.
const UNHEALTHY: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let config = HealthConfig::parse();

    if let Err(e) = logging::init(&config.log) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(UNHEALTHY);
    }

    match ping_primary(&config.mongo.host).await {
        Ok(()) => {
            println!("Status OK.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "MongoDB primary is unreachable");
            ExitCode::from(UNHEALTHY)
        }
    }
}

async fn ping_primary(uri: &str) -> mongodb::error::Result<()> {
    let client = mongodb::Client::with_uri_str(uri).await?;
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
        .await?;
    Ok(())
}
