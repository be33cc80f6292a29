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

//! Process wiring for the Penne change-stream relay.
//!
//! The `penne` binary reads its settings from the environment (see
//! [`config::RelayConfig`]), builds a checkpoint store and one sink per entry
//! of `EXPORT_DESTINATION`, then relays one collection's change stream until
//! it is interrupted. `penne-health` pings the primary and exits non-zero when
//! it is unreachable.

#![warn(missing_docs)]

pub mod app;
pub mod config;
pub mod logging;
pub mod registry;

pub use app::{AppError, RelayComponents};
pub use config::{HealthConfig, RelayConfig};
