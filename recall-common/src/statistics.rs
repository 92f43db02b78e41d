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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Load and invalidation counters of a cache.
#[derive(Debug, Default)]
pub struct Statistics {
    fetches: AtomicU64,
    hits: AtomicU64,
    not_found: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    stale: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Fetch collaborator invocations.
    pub fetches: u64,
    /// Loads answered by an already loaded key.
    pub hits: u64,
    /// Fetches that reported absence.
    pub not_found: u64,
    /// Fetches that failed or returned a mismatched id.
    pub failures: u64,
    /// Explicit evictions.
    pub evictions: u64,
    /// Fetch results discarded because the key was evicted or reset meanwhile.
    pub stale: u64,
    /// Query keys reset by an entity eviction.
    pub invalidations: u64,
}

macro_rules! counters {
    ($($field:ident => $record:ident,)*) => {
        impl Statistics {
            $(
                #[doc = concat!("Record one `", stringify!($field), "` event.")]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                #[doc = concat!("Current `", stringify!($field), "` count.")]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*

            /// Take a point-in-time copy of all counters.
            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $($field: self.$field(),)*
                }
            }
        }
    };
}

counters! {
    fetches => record_fetch,
    hits => record_hit,
    not_found => record_not_found,
    failures => record_failure,
    evictions => record_eviction,
    stale => record_stale,
    invalidations => record_invalidation,
}
