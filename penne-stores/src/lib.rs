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

//! Checkpoint store implementations for the Penne relay.
//!
//! Each store implements
//! [`CheckpointStore`](penne_core::checkpoint::CheckpointStore) and keeps a
//! single opaque checkpoint per key.
//!
//! # Available Stores
//!
//! - [`memory::MemoryStore`]: in-process, for tests and local runs
//! - [`file::FileStore`]: local filesystem with atomic replace
//! - `s3::S3Store` (`s3` feature): AWS S3 or S3-compatible services
//! - `gcs::GcsStore` (`gcs` feature): Google Cloud Storage
//!
//! # Example: File Store
//!
//! ```rust,no_run
//! use penne_core::checkpoint::{checkpoint_key, CheckpointStore};
//! use penne_stores::file::FileStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = checkpoint_key("/var/lib/penne", "orders.dat");
//! FileStore::new().put(&key, b"826A01").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod file;
pub mod memory;

#[cfg(feature = "gcs")]
pub mod gcs;

#[cfg(feature = "s3")]
pub mod s3;

/// Object names derived from checkpoint keys never start with `/`.
#[cfg(any(feature = "s3", feature = "gcs"))]
pub(crate) fn object_name(key: &str) -> &str {
    key.trim_start_matches('/')
}

#[cfg(all(test, any(feature = "s3", feature = "gcs")))]
mod tests {
    use super::object_name;

    #[test]
    fn object_names_are_relative() {
        assert_eq!(object_name("/tokens/orders.dat"), "tokens/orders.dat");
        assert_eq!(object_name("orders.dat"), "orders.dat");
    }
}
