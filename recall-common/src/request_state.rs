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

use std::{fmt::Debug, hash::Hash, sync::Arc};

use equivalent::Equivalent;
use hashbrown::HashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Status of the request for a single key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// No request was ever issued, or the key was cleared.
    #[default]
    None,
    /// A request is in flight.
    InProgress,
    /// The last request succeeded.
    Done,
    /// The last request failed.
    Error,
    /// The last request reported that the key does not exist.
    NotFound,
}

impl RequestStatus {
    /// Returns `true` if the status ends a load episode.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::NotFound)
    }
}

/// Factory of the auxiliary payload of a key that is touched for the first time.
pub type StateFactory<S> = Arc<dyn Fn() -> S + Send + Sync + 'static>;

#[derive(Debug)]
struct Slot<S> {
    status: RequestStatus,
    state: Option<S>,
    error: Option<Error>,
    /// Touch sequence, used to enumerate keys in first-touched order.
    seq: u64,
}

/// A single key visited by [`RequestStates::for_each`].
#[derive(Debug, PartialEq, Eq)]
pub struct RequestEntry<'a, K, S> {
    /// The key.
    pub id: &'a K,
    /// Current status of the key.
    pub status: RequestStatus,
    /// Auxiliary payload of the key.
    pub state: Option<&'a S>,
}

/// Keyed request state machine.
///
/// Tracks a [`RequestStatus`], the last error, and an optional auxiliary payload per key. A key that has never been
/// touched with [`RequestStates::set_status`] or [`RequestStates::set_state`] is indistinguishable from an unknown key.
pub struct RequestStates<K, S> {
    slots: HashMap<K, Slot<S>>,
    factory: Option<StateFactory<S>>,
    seq: u64,
}

impl<K, S> Debug for RequestStates<K, S>
where
    K: Debug,
    S: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStates")
            .field("slots", &self.slots)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

impl<K, S> Default for RequestStates<K, S> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            factory: None,
            seq: 0,
        }
    }
}

impl<K, S> RequestStates<K, S>
where
    K: Hash + Eq,
{
    /// Create request states without a payload factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create request states that produce the payload of a first-touched key with the given factory.
    pub fn with_factory(factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            factory: Some(Arc::new(factory)),
            ..Default::default()
        }
    }

    /// Current status of the key, [`RequestStatus::None`] for unseen keys.
    pub fn status<Q>(&self, key: &Q) -> RequestStatus
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.slots.get(key).map(|slot| slot.status).unwrap_or_default()
    }

    /// Returns `true` if the current status of the key is one of the candidates.
    pub fn is_status<Q>(&self, key: &Q, candidates: &[RequestStatus]) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        candidates.contains(&self.status(key))
    }

    /// The error recorded with the last transition to [`RequestStatus::Error`].
    pub fn error<Q>(&self, key: &Q) -> Option<&Error>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.slots.get(key).and_then(|slot| slot.error.as_ref())
    }

    /// Set the status of the key.
    ///
    /// The error is stored only with [`RequestStatus::Error`], any other status clears the stored error.
    pub fn set_status(&mut self, key: K, status: RequestStatus, error: Option<Error>) {
        let slot = self.touch(key);
        slot.status = status;
        slot.error = match status {
            RequestStatus::Error => error,
            _ => None,
        };
    }

    /// Replace the payload of the key without touching its status.
    pub fn set_state(&mut self, key: K, state: S) {
        self.touch(key).state = Some(state);
    }

    /// Payload of the key, or the factory default for an unseen key.
    pub fn get_state<Q>(&self, key: &Q) -> Option<S>
    where
        Q: Hash + Equivalent<K> + ?Sized,
        S: Clone,
    {
        match self.slots.get(key) {
            Some(slot) => slot.state.clone(),
            None => self.factory.as_ref().map(|factory| factory()),
        }
    }

    /// Borrow the payload of a touched key.
    pub fn state<Q>(&self, key: &Q) -> Option<&S>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.slots.get(key).and_then(|slot| slot.state.as_ref())
    }

    /// Remove all state of the key.
    pub fn delete<Q>(&mut self, key: &Q)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.slots.remove(key);
    }

    /// Remove all keys.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    /// Visit all touched keys in first-touched order.
    pub fn for_each(&self, mut f: impl FnMut(RequestEntry<'_, K, S>)) {
        self.iter().for_each(&mut f);
    }

    /// Iterate over all touched keys in first-touched order.
    pub fn iter(&self) -> impl Iterator<Item = RequestEntry<'_, K, S>> {
        self.slots
            .iter()
            .sorted_by_key(|(_, slot)| slot.seq)
            .map(|(id, slot)| RequestEntry {
                id,
                status: slot.status,
                state: slot.state.as_ref(),
            })
    }

    /// Count of touched keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no key has been touched.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn touch(&mut self, key: K) -> &mut Slot<S> {
        let factory = &self.factory;
        let seq = &mut self.seq;
        self.slots.entry(key).or_insert_with(|| {
            *seq += 1;
            Slot {
                status: RequestStatus::None,
                state: factory.as_ref().map(|factory| factory()),
                error: None,
                seq: *seq,
            }
        })
    }
}
