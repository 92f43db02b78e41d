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

use std::{fmt::Debug, hash::Hash};

use serde::Serialize;

/// Key trait for the caches.
///
/// Used for both entity ids and serialized query keys.
pub trait Key: Send + Sync + 'static + Hash + Eq + Clone + Debug {}
impl<T: Send + Sync + 'static + std::hash::Hash + Eq + Clone + Debug> Key for T {}

/// A fully resolved domain object retrievable by a stable identifier.
pub trait Entity: Send + Sync + 'static + Clone + Debug {
    /// Identifier type of the entity.
    type Id: Key;

    /// Project the identifier out of the entity.
    ///
    /// Must be pure and deterministic. The caches use it to key inserts and to validate fetch results.
    fn id(&self) -> Self::Id;
}

/// A caller-supplied query whose fetch yields an ordered list of entities.
pub trait QueryKey: Send + Sync + 'static {
    /// Stable serialization of the query.
    ///
    /// Equivalent query values must produce the same key.
    fn query_key(&self) -> String;
}

impl QueryKey for String {
    fn query_key(&self) -> String {
        self.clone()
    }
}

impl QueryKey for &'static str {
    fn query_key(&self) -> String {
        self.to_string()
    }
}

/// Serialize a query into a key with `serde_json`.
///
/// The output is stable for a given type because struct fields are serialized in declaration order.
/// Map-typed fields must use an ordered map for the key to be stable.
pub fn json_key<T>(query: &T) -> String
where
    T: Serialize + ?Sized,
{
    match serde_json::to_string(query) {
        Ok(key) => key,
        // Only maps with non-string keys end up here.
        Err(e) => {
            tracing::warn!("[key]: cannot serialize query into json key, error: {e}");
            std::any::type_name::<T>().to_string()
        }
    }
}
