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

//! Logging setup for the relay binaries.

use crate::config::LogArgs;
use std::fs::{self, OpenOptions};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file or its directory could not be opened.
    #[error("failed to open log output {path}: {source}")]
    Output {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The level is not a valid filter directive.
    #[error("invalid log level {0:?}")]
    Level(String),

    /// A global subscriber was already installed.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Console,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// `console` selects [`LogFormat::Console`]; anything else is JSON.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("console") {
            Self::Console
        } else {
            Self::Json
        }
    }
}

/// Maps `LOG_LEVEL` to a filter directive: `0` (or empty) is `info`, `1` is
/// `error`, anything else is used verbatim.
pub fn level_directive(raw: &str) -> String {
    match raw.trim() {
        "" | "0" => "info".to_string(),
        "1" => "error".to_string(),
        other => other.to_string(),
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence
/// over the configured level.
///
/// # Errors
///
/// Returns [`LoggingError`] if the output cannot be opened, the level does
/// not parse, or a subscriber is already installed.
pub fn init(args: &LogArgs) -> Result<(), LoggingError> {
    let directive = level_directive(&args.level);
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directive).map_err(|_| LoggingError::Level(directive.clone()))?,
    };

    let writer = match args.output_path() {
        Some(path) => {
            let display = path.display().to_string();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| LoggingError::Output {
                    path: display.clone(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| LoggingError::Output { path: display, source })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let installed = match LogFormat::parse(&args.format) {
        LogFormat::Console => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_levels() {
        assert_eq!(level_directive("0"), "info");
        assert_eq!(level_directive(""), "info");
        assert_eq!(level_directive("1"), "error");
        assert_eq!(level_directive("debug,mongodb=warn"), "debug,mongodb=warn");
    }

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse("console"), LogFormat::Console);
        assert_eq!(LogFormat::parse("Console "), LogFormat::Console);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }
}
