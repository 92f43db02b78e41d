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

//! Entity and query caches with single-flight loading.
//!
//! [`EntityCache`] caches entities by id and loads missing ids through an [`EntityFetcher`]. [`QueryCache`] caches
//! query results as id lists on top of an entity cache, and resets every query that references an evicted entity.
//!
//! ```ignore
//! use recall::prelude::*;
//!
//! let entities = EntityCacheBuilder::new(|id: u64| async move { api::user(id).await }).build();
//! let users = QueryCacheBuilder::new(entities, |q: &String| {
//!     let q = q.clone();
//!     async move { api::search(&q).await.map(FetchByQueryResult::from) }
//! })
//! .build();
//!
//! let found = users.by_query_async(&"alice".to_string()).await;
//! ```

mod inflight;

/// Cache of entities by id.
pub mod entity;
/// Cache of query results over an entity cache.
pub mod query;

/// Re-exports of the commonly used types.
pub mod prelude;

pub use prelude::*;
