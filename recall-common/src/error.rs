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

use std::sync::Arc;

/// recall error.
///
/// The error is cheap to clone, so a single failed load can be delivered to every waiter and every error listener.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The fetch collaborator failed.
    #[error("fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),
    /// The fetched entity carries a different id than the requested one.
    #[error("fetched entity has id {fetched} but {requested} was requested")]
    IdentityMismatch {
        /// Debug representation of the requested id.
        requested: String,
        /// Debug representation of the id extracted from the fetched entity.
        fetched: String,
    },
    /// The key was evicted, or the whole cache was reset, while the caller was waiting.
    #[error("entity evicted while loading")]
    Evicted,
    /// The cache was dropped before the waiter was settled.
    #[error("cache closed")]
    Closed,
    /// A background load task failed to complete.
    #[error("background load join error: {0}")]
    Join(Arc<tokio::task::JoinError>),
}

impl Error {
    /// Wrap a fetch collaborator failure.
    pub fn fetch(e: impl Into<anyhow::Error>) -> Self {
        Self::Fetch(Arc::new(e.into()))
    }

    /// Create an identity mismatch error from the requested and the fetched ids.
    pub fn identity_mismatch(requested: &impl std::fmt::Debug, fetched: &impl std::fmt::Debug) -> Self {
        Self::IdentityMismatch {
            requested: format!("{requested:?}"),
            fetched: format!("{fetched:?}"),
        }
    }

    /// Returns `true` if the error was raised by an eviction or a reset.
    pub fn is_evicted(&self) -> bool {
        matches!(self, Self::Evicted)
    }

    /// Downcast the fetch failure to a specific type.
    ///
    /// Only `Fetch` carries a source that can be downcasted.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        match self {
            Self::Fetch(e) => e.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(Arc::new(e))
    }
}

/// recall result.
pub type Result<T> = std::result::Result<T, Error>;
