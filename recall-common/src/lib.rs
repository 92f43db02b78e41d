// Copyright 2026 recall Project Authors
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

//! Shared components for recall.

/// Error and result types.
pub mod error;
/// Entity and query key traits.
pub mod key;
/// Error listener registry and eviction listeners.
pub mod listener;
/// Per-key request status tracking.
pub mod request_state;
/// Background task spawning.
pub mod spawn;
/// Load and invalidation counters.
pub mod statistics;
