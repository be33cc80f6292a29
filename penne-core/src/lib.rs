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

//! Penne Core - change stream relay building blocks
//!
//! This crate holds everything the relay needs that is independent of a
//! particular sink vendor or checkpoint backend.
//!
//! # Key Components
//!
//! - [`event`]: decoded change stream events
//! - [`sink`]: the [`SinkAdapter`](sink::SinkAdapter) contract
//! - [`dispatcher`]: concurrent fan-out of one event to every sink
//! - [`checkpoint`]: checkpoint store contract and rate-limited writer
//! - [`bulk`]: size-triggered bulk index buffer
//! - [`stream`]: change stream sources and watch requests
//! - [`relay`]: the loop tying it all together
//! - [`metrics`]: metric names and recording helpers
//!
//! # Example
//!
//! ```rust
//! use penne_core::event::{ChangeEvent, OperationType};
//!
//! fn describe(event: &ChangeEvent) -> &'static str {
//!     match event.operation {
//!         OperationType::Insert => "inserted",
//!         OperationType::Update | OperationType::Replace => "changed",
//!         OperationType::Delete => "deleted",
//!         _ => "other",
//!     }
//! }
//! ```

pub mod bulk;
pub mod checkpoint;
pub mod dispatcher;
pub mod event;
pub mod metrics;
pub mod relay;
pub mod sink;
pub mod stream;
