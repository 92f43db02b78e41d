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

use std::hash::Hash;

use equivalent::Equivalent;
use hashbrown::HashMap;
use recall_common::error::{Error, Result};
use tokio::sync::oneshot;

pub type Notifier<T> = oneshot::Sender<Result<T>>;
pub type Waiter<T> = oneshot::Receiver<Result<T>>;

/// Terminal outcome of a successful entity load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The entity was fetched and cached.
    Done,
    /// The fetch reported absence.
    NotFound,
}

/// Load tickets and waiter lists per key.
///
/// Every load episode takes a ticket. Evicting or resetting a key drops its ticket, so a completion that still holds
/// the old ticket is recognized as stale.
///
/// Plain waiters are settled by the next completion of the key. Durable waiters are only settled by
/// [`InflightMap::take_all`], [`InflightMap::cancel`] or [`InflightMap::cancel_all`], and stay registered across
/// completions settled with [`InflightMap::take`].
#[derive(Debug)]
pub struct InflightMap<K, T> {
    tickets: HashMap<K, u64>,
    notifiers: HashMap<K, Vec<Notifier<T>>>,
    durable: HashMap<K, Vec<Notifier<T>>>,
    next: u64,
}

impl<K, T> Default for InflightMap<K, T> {
    fn default() -> Self {
        Self {
            tickets: HashMap::new(),
            notifiers: HashMap::new(),
            durable: HashMap::new(),
            next: 0,
        }
    }
}

impl<K, T> InflightMap<K, T>
where
    K: Hash + Eq,
{
    /// Start a new load episode for the key, superseding any previous one.
    pub fn launch(&mut self, key: K) -> u64 {
        let ticket = self.next;
        self.next += 1;
        self.tickets.insert(key, ticket);
        ticket
    }

    /// Finish the load episode. Returns `false` if the ticket has been superseded or dropped.
    pub fn finish<Q>(&mut self, key: &Q, ticket: u64) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        match self.tickets.get(key) {
            Some(t) if *t == ticket => {
                self.tickets.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Register a waiter for the current or next completion of the key.
    pub fn wait(&mut self, key: K) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        self.notifiers.entry(key).or_default().push(tx);
        rx
    }

    /// Register a durable waiter for the key.
    pub fn wait_durable(&mut self, key: K) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        self.durable.entry(key).or_default().push(tx);
        rx
    }

    /// Take the plain waiters of the key in registration order.
    pub fn take<Q>(&mut self, key: &Q) -> Vec<Notifier<T>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.notifiers.remove(key).unwrap_or_default()
    }

    /// Take the plain waiters, then the durable waiters of the key.
    pub fn take_all<Q>(&mut self, key: &Q) -> Vec<Notifier<T>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let mut notifiers = self.take(key);
        notifiers.extend(self.durable.remove(key).unwrap_or_default());
        notifiers
    }

    /// Drop the ticket of the key and take all its waiters.
    pub fn cancel<Q>(&mut self, key: &Q) -> Vec<Notifier<T>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.tickets.remove(key);
        self.take_all(key)
    }

    /// Drop all tickets and take all waiters.
    pub fn cancel_all(&mut self) -> Vec<Notifier<T>> {
        self.tickets.clear();
        self.notifiers
            .drain()
            .chain(self.durable.drain())
            .flat_map(|(_, notifiers)| notifiers)
            .collect()
    }

    /// Returns `true` if the key has a load episode in flight.
    pub fn is_inflight<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.tickets.contains_key(key)
    }
}

/// Settle all notifiers with the same result.
pub fn notify<T>(notifiers: Vec<Notifier<T>>, res: Result<T>)
where
    T: Clone,
{
    for notifier in notifiers {
        // The waiter may have been dropped.
        let _ = notifier.send(res.clone());
    }
}

/// Await a waiter, treating a dropped notifier as a closed cache.
pub async fn wait<T>(waiter: Waiter<T>) -> Result<T> {
    waiter.await.unwrap_or_else(|_| Err(Error::Closed))
}
