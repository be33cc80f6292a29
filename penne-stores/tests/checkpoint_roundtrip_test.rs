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

//! Restart behaviour of the rate-limited writer over real stores.

use penne_core::checkpoint::{
    checkpoint_key, default_file_name, CheckpointStore, RateLimitedCheckpointWriter, SaveOutcome,
};
use penne_stores::file::FileStore;
use penne_stores::memory::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_file_checkpoint_survives_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let key = checkpoint_key(&dir.path().to_string_lossy(), &default_file_name("orders"));

    let first = RateLimitedCheckpointWriter::new(Arc::new(FileStore::new()), key.clone(), Duration::ZERO);
    assert_eq!(first.load().await, None);
    assert_eq!(first.maybe_save("826A01").await.unwrap(), SaveOutcome::Written);
    assert_eq!(first.maybe_save("826A02").await.unwrap(), SaveOutcome::Written);

    let second = RateLimitedCheckpointWriter::new(Arc::new(FileStore::new()), key, Duration::ZERO);
    assert_eq!(second.load().await.as_deref(), Some("826A02"));
}

#[tokio::test]
async fn test_file_checkpoint_with_trailing_newline() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let key = checkpoint_key(&dir.path().to_string_lossy(), "orders.dat");
    std::fs::write(&key, "826A03\n").unwrap();

    let writer = RateLimitedCheckpointWriter::new(Arc::new(FileStore::new()), key, Duration::ZERO);
    assert_eq!(writer.load().await.as_deref(), Some("826A03"));
}

#[tokio::test(start_paused = true)]
async fn test_memory_store_records_only_unthrottled_writes() {
    let store = MemoryStore::new();
    let writer = RateLimitedCheckpointWriter::new(
        Arc::new(store.clone()) as Arc<dyn CheckpointStore>,
        "orders.dat",
        Duration::from_secs(30),
    );

    writer.maybe_save("a").await.unwrap();
    writer.maybe_save("b").await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    writer.maybe_save("c").await.unwrap();

    let written: Vec<Vec<u8>> = store.put_history().await.into_iter().map(|(_, v)| v).collect();
    assert_eq!(written, vec![b"a".to_vec(), b"c".to_vec()]);
}
