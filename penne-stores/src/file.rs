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

//! Local filesystem checkpoint store.
//!
//! The checkpoint key is used as the file path. Writes go to a sibling
//! temporary file that is then renamed over the target, so a crash mid-write
//! leaves either the old or the new checkpoint, never a torn one.

use async_trait::async_trait;
use penne_core::checkpoint::{CheckpointError, CheckpointStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// [`CheckpointStore`] writing one file per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl FileStore {
    /// Creates a file store.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        path.with_file_name(name)
    }

    async fn write_synced(temp: &Path, value: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(temp).await?;
        file.write_all(value).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        trace!(path = key, "Reading checkpoint file");
        match tokio::fs::read(key).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CheckpointError::NotFound(key.to_string())),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), CheckpointError> {
        let path = Path::new(key);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = Self::temp_path(path);
        let written = match Self::write_synced(&temp, value).await {
            Ok(()) => tokio::fs::rename(&temp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CheckpointError::Io(e));
        }
        debug!(path = key, bytes = value.len(), "Checkpoint file written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = FileStore::new().get(&key(&dir, "none.dat")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_creates_parents_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let key = key(&dir, "nested/deeper/orders.dat");
        let store = FileStore::new();

        store.put(&key, b"first").await.unwrap();
        store.put(&key, b"second").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested/deeper"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn failed_put_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let key = key(&dir, "orders.dat");
        std::fs::create_dir_all(dir.path().join("orders.dat/occupied")).unwrap();

        let err = FileStore::new().put(&key, b"t1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)));

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["orders.dat"]);
    }

    #[tokio::test]
    async fn unwritable_temp_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let key = key(&dir, "orders.dat");
        std::fs::create_dir(FileStore::temp_path(Path::new(&key))).unwrap();

        let err = FileStore::new().put(&key, b"t1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)));
        assert!(!Path::new(&key).exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let key = key(&dir, "orders.dat");
        let store = FileStore::new();
        store.put(&key, b"x").await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }
}
