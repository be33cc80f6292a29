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

//! JSON-lines sink writing to stdout or a local file.
//!
//! Each event becomes one line shaped like a structured log record:
//!
//! ```json
//! {"time":"2025-01-15T10:30:00.000Z","name":"exporter","logType":"changeStream","cs":{...}}
//! ```
//!
//! Key names are configurable so the output can match an existing log
//! pipeline. The file variant rotates to `<path>.1` once a size limit is
//! reached.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use penne_core::event::ChangeEvent;
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Registry name of this sink.
pub const SINK_NAME: &str = "file";

/// Value of the name key on every line.
pub const LOGGER_NAME: &str = "exporter";

/// Value of the log type key on every line.
pub const LOG_TYPE: &str = "changeStream";

/// Default output file when no log directory is configured.
pub const DEFAULT_FILE_PATH: &str = "./changestream.log";

/// Line layout of the file sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSinkConfig {
    /// Key holding the write time
    pub time_key: String,
    /// Key holding the logger name
    pub name_key: String,
    /// Key holding the log type
    pub log_type_key: String,
    /// Key holding the event
    pub change_stream_key: String,
    /// Rotate the output file once it reaches this size; `None` disables
    /// rotation. Ignored for stdout.
    pub max_bytes: Option<u64>,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            time_key: "time".to_string(),
            name_key: "name".to_string(),
            log_type_key: "logType".to_string(),
            change_stream_key: "cs".to_string(),
            max_bytes: None,
        }
    }
}

impl FileSinkConfig {
    /// Creates a builder starting from the default layout.
    #[must_use]
    pub fn builder() -> FileSinkConfigBuilder {
        FileSinkConfigBuilder::default()
    }

    /// Renders one event as a JSON line including the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the line cannot be encoded.
    pub fn render(&self, event: &ChangeEvent) -> Result<Vec<u8>, SinkError> {
        let mut line = Map::new();
        line.insert(
            self.time_key.clone(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.insert(self.name_key.clone(), Value::String(LOGGER_NAME.to_string()));
        line.insert(self.log_type_key.clone(), Value::String(LOG_TYPE.to_string()));
        line.insert(self.change_stream_key.clone(), event.to_json());

        let mut out = serde_json::to_vec(&Value::Object(line))
            .map_err(|e| SinkError::serialization(e, "failed to encode change stream line"))?;
        out.push(b'\n');
        Ok(out)
    }
}

/// Builder for [`FileSinkConfig`]. Empty key names keep the default.
#[derive(Debug, Default)]
pub struct FileSinkConfigBuilder {
    time_key: Option<String>,
    name_key: Option<String>,
    log_type_key: Option<String>,
    change_stream_key: Option<String>,
    max_megabytes: Option<u64>,
}

impl FileSinkConfigBuilder {
    /// Sets the time key.
    #[must_use]
    pub fn time_key(mut self, key: impl Into<String>) -> Self {
        self.time_key = Some(key.into());
        self
    }

    /// Sets the name key.
    #[must_use]
    pub fn name_key(mut self, key: impl Into<String>) -> Self {
        self.name_key = Some(key.into());
        self
    }

    /// Sets the log type key.
    #[must_use]
    pub fn log_type_key(mut self, key: impl Into<String>) -> Self {
        self.log_type_key = Some(key.into());
        self
    }

    /// Sets the event key.
    #[must_use]
    pub fn change_stream_key(mut self, key: impl Into<String>) -> Self {
        self.change_stream_key = Some(key.into());
        self
    }

    /// Sets the rotation threshold in megabytes; 0 disables rotation.
    #[must_use]
    pub fn max_megabytes(mut self, megabytes: u64) -> Self {
        self.max_megabytes = Some(megabytes);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if two keys share a name.
    pub fn build(self) -> Result<FileSinkConfig, String> {
        let defaults = FileSinkConfig::default();
        let pick = |value: Option<String>, default: String| {
            value.filter(|v| !v.trim().is_empty()).unwrap_or(default)
        };
        let config = FileSinkConfig {
            time_key: pick(self.time_key, defaults.time_key),
            name_key: pick(self.name_key, defaults.name_key),
            log_type_key: pick(self.log_type_key, defaults.log_type_key),
            change_stream_key: pick(self.change_stream_key, defaults.change_stream_key),
            max_bytes: self
                .max_megabytes
                .filter(|mb| *mb > 0)
                .map(|mb| mb.saturating_mul(1024 * 1024)),
        };

        let mut keys = [
            &config.time_key,
            &config.name_key,
            &config.log_type_key,
            &config.change_stream_key,
        ];
        keys.sort();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err("file sink keys must be distinct".to_string());
        }
        Ok(config)
    }
}

enum Output {
    Stdout(tokio::io::Stdout),
    File {
        path: PathBuf,
        file: File,
        written: u64,
    },
}

impl Output {
    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        match self {
            Self::Stdout(out) => out,
            Self::File { file, .. } => file,
        }
    }
}

/// Sink appending one JSON line per event.
pub struct FileSink {
    config: FileSinkConfig,
    output: Mutex<Output>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("config", &self.config).finish_non_exhaustive()
    }
}

impl FileSink {
    /// Writes to the process's standard output.
    #[must_use]
    pub fn stdout(config: FileSinkConfig) -> Self {
        Self {
            config,
            output: Mutex::new(Output::Stdout(tokio::io::stdout())),
        }
    }

    /// Appends to `path`, creating it and its parent directories.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>, config: FileSinkConfig) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let (file, written) = open_append(&path).await?;
        info!(path = %path.display(), "File sink opened");
        Ok(Self {
            config,
            output: Mutex::new(Output::File {
                path,
                file,
                written,
            }),
        })
    }

    /// Returns the line layout.
    pub fn config(&self) -> &FileSinkConfig {
        &self.config
    }

    async fn rotate_if_needed(&self, output: &mut Output, incoming: u64) -> Result<(), SinkError> {
        let Some(limit) = self.config.max_bytes else {
            return Ok(());
        };
        let Output::File {
            path,
            file,
            written,
        } = output
        else {
            return Ok(());
        };
        if *written == 0 || *written + incoming <= limit {
            return Ok(());
        }

        file.flush().await.map_err(|e| SinkError::write(e, true))?;
        let rotated = rotated_path(path);
        fs::rename(&*path, &rotated)
            .await
            .map_err(|e| SinkError::write(e, true))?;
        let (fresh, size) = open_append(path).await?;
        *file = fresh;
        *written = size;
        debug!(path = %path.display(), rotated = %rotated.display(), "Rotated file sink output");
        Ok(())
    }
}

#[async_trait]
impl SinkAdapter for FileSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let line = self.config.render(event)?;
        let mut output = self.output.lock().await;
        self.rotate_if_needed(&mut output, line.len() as u64).await?;

        let writer = output.writer();
        writer
            .write_all(&line)
            .await
            .map_err(|e| SinkError::write(e, true))?;
        writer.flush().await.map_err(|e| SinkError::write(e, true))?;

        if let Output::File { written, .. } = &mut *output {
            *written += line.len() as u64;
        }
        Ok(Delivery::Delivered)
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut output = self.output.lock().await;
        output
            .writer()
            .flush()
            .await
            .map_err(|e| SinkError::write(e, false))
    }
}

async fn open_append(path: &Path) -> Result<(File, u64), SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(SinkError::connection)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(SinkError::connection)?;
    let size = file.metadata().await.map_err(SinkError::connection)?.len();
    Ok((file, size))
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}
