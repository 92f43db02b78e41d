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

use std::{fmt::Debug, future::Future, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use recall_common::{
    error::{Error, Result},
    key::Entity,
    listener::{ErrorListener, ErrorListeners, EvictionListener, ListenerId},
    request_state::{RequestStates, RequestStatus},
    spawn::{SpawnHandle, Spawner},
    statistics::Statistics,
};
use tokio::sync::watch;

use crate::inflight::{self, InflightMap, Outcome, Waiter};

/// Fetch collaborator of the entity cache.
///
/// `Ok(None)` reports that the entity does not exist, which is a distinct outcome from a failure.
pub trait EntityFetcher<E>: Send + Sync + 'static
where
    E: Entity,
{
    /// Fetch the entity with the given id.
    fn fetch(&self, id: E::Id) -> BoxFuture<'static, anyhow::Result<Option<E>>>;
}

impl<E, F, FU> EntityFetcher<E> for F
where
    E: Entity,
    F: Fn(E::Id) -> FU + Send + Sync + 'static,
    FU: Future<Output = anyhow::Result<Option<E>>> + Send + 'static,
{
    fn fetch(&self, id: E::Id) -> BoxFuture<'static, anyhow::Result<Option<E>>> {
        self(id).boxed()
    }
}

/// How a load request was answered.
pub(crate) enum Load<T> {
    /// Nothing to wait for: the key is loaded, failed, or the caller did not ask to wait.
    Ready,
    /// Another load is in flight.
    Wait(Waiter<T>),
    /// This request launched the fetch.
    Fetch(SpawnHandle<()>),
}

struct EntityState<E>
where
    E: Entity,
{
    entities: HashMap<E::Id, E>,
    requests: RequestStates<E::Id, ()>,
    inflights: InflightMap<E::Id, Outcome>,
}

struct Inner<E>
where
    E: Entity,
{
    name: String,
    state: Mutex<EntityState<E>>,
    fetcher: Arc<dyn EntityFetcher<E>>,
    listeners: ErrorListeners,
    eviction_listeners: RwLock<Vec<Arc<dyn EvictionListener<Id = E::Id>>>>,
    spawner: Spawner,
    statistics: Arc<Statistics>,
    revision: watch::Sender<u64>,
}

/// Builder of [`EntityCache`].
pub struct EntityCacheBuilder<E>
where
    E: Entity,
{
    name: String,
    fetcher: Arc<dyn EntityFetcher<E>>,
    spawner: Option<Spawner>,
    listeners: Vec<Arc<dyn ErrorListener>>,
    eviction_listeners: Vec<Arc<dyn EvictionListener<Id = E::Id>>>,
}

impl<E> EntityCacheBuilder<E>
where
    E: Entity,
{
    /// Create a builder with the fetch collaborator.
    pub fn new(fetcher: impl EntityFetcher<E>) -> Self {
        Self {
            name: "entity".to_string(),
            fetcher: Arc::new(fetcher),
            spawner: None,
            listeners: vec![],
            eviction_listeners: vec![],
        }
    }

    /// Set the name of the cache, used in logs.
    ///
    /// The default value is `entity`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set where background loads are spawned.
    ///
    /// The default value is the runtime that calls [`EntityCacheBuilder::build`].
    pub fn with_spawner(mut self, spawner: impl Into<Spawner>) -> Self {
        self.spawner = Some(spawner.into());
        self
    }

    /// Register an error listener from the start.
    pub fn with_error_listener(mut self, listener: impl ErrorListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Register an eviction listener from the start.
    pub fn with_eviction_listener(mut self, listener: Arc<dyn EvictionListener<Id = E::Id>>) -> Self {
        self.eviction_listeners.push(listener);
        self
    }

    /// Build the entity cache.
    ///
    /// # Panics
    ///
    /// Panics if no spawner is set and the builder is used outside of a tokio runtime.
    pub fn build(self) -> EntityCache<E> {
        let listeners = ErrorListeners::default();
        for listener in self.listeners {
            listeners.add(listener);
        }
        let (revision, _) = watch::channel(0);
        EntityCache {
            inner: Arc::new(Inner {
                name: self.name,
                state: Mutex::new(EntityState {
                    entities: HashMap::new(),
                    requests: RequestStates::new(),
                    inflights: InflightMap::default(),
                }),
                fetcher: self.fetcher,
                listeners,
                eviction_listeners: RwLock::new(self.eviction_listeners),
                spawner: self.spawner.unwrap_or_else(Spawner::current),
                statistics: Arc::new(Statistics::default()),
                revision,
            }),
        }
    }
}

/// Cache of fully resolved entities keyed by id.
///
/// Loads are single-flight: concurrent requests for the same id share one invocation of the fetch collaborator.
/// The cache is a cheap handle, clones share the same state.
pub struct EntityCache<E>
where
    E: Entity,
{
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EntityCache<E>
where
    E: Entity,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Debug for EntityCache<E>
where
    E: Entity,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

impl<E> EntityCache<E>
where
    E: Entity,
{
    /// Return the cached entity and trigger a background load if the id is not loaded yet.
    ///
    /// Never blocks.
    pub fn by_id(&self, id: &E::Id) -> Option<E> {
        let _ = self.load(id, false);
        self.peek(id)
    }

    /// Wait for the load of the id to reach a terminal status and return the cached entity.
    ///
    /// Returns `None` if the entity does not exist, the fetch failed, or the id was evicted meanwhile.
    pub async fn by_id_async(&self, id: &E::Id) -> Option<E> {
        match self.load(id, true) {
            Load::Ready => {}
            Load::Wait(waiter) => {
                if let Err(e) = inflight::wait(waiter).await {
                    tracing::debug!("[{}]: wait for {id:?} ended without entity, error: {e}", self.inner.name);
                }
            }
            Load::Fetch(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!("[{}]: background load of {id:?} did not complete, error: {e}", self.inner.name);
                }
            }
        }
        self.peek(id)
    }

    /// Wait until the current or next load of the id reaches [`RequestStatus::Done`].
    ///
    /// The waiter is registered when this method is called, not when the returned future is first polled. A load that
    /// ends with [`RequestStatus::NotFound`] keeps the waiter registered for a later one. Fails with the stored error if
    /// the load fails, and with [`Error::Evicted`] if the id is evicted or the cache is reset meanwhile.
    pub fn wait_for_id(&self, id: &E::Id) -> impl Future<Output = Result<()>> + Send + 'static {
        let waiter = self.inner.state.lock().inflights.wait_durable(id.clone());
        async move { inflight::wait(waiter).await.map(|_| ()) }
    }

    /// Returns `true` if an entity is cached for the id, regardless of its request status.
    pub fn is_loaded(&self, id: &E::Id) -> bool {
        self.inner.state.lock().entities.contains_key(id)
    }

    /// Returns `true` if a fetch has been attempted for the id.
    pub fn is_known(&self, id: &E::Id) -> bool {
        self.inner.state.lock().requests.is_status(
            id,
            &[
                RequestStatus::InProgress,
                RequestStatus::Done,
                RequestStatus::Error,
                RequestStatus::NotFound,
            ],
        )
    }

    /// Request status of the id.
    pub fn status(&self, id: &E::Id) -> RequestStatus {
        self.inner.state.lock().requests.status(id)
    }

    /// The error of the last failed load of the id.
    pub fn error(&self, id: &E::Id) -> Option<Error> {
        self.inner.state.lock().requests.error(id).cloned()
    }

    /// Return the cached entity without triggering a load.
    pub fn peek(&self, id: &E::Id) -> Option<E> {
        self.inner.state.lock().entities.get(id).cloned()
    }

    /// Insert or overwrite the entity without touching its request status.
    pub fn add(&self, entity: E) {
        self.inner.state.lock().entities.insert(entity.id(), entity);
        self.bump();
    }

    /// Remove the cached entity and the request state of the id.
    ///
    /// Pending waiters of the id fail with [`Error::Evicted`]. An in-flight fetch is not cancelled, but its result is
    /// discarded. Evicting an unknown id is a no-op.
    pub fn evict(&self, id: &E::Id) {
        let notifiers = {
            let mut state = self.inner.state.lock();
            state.entities.remove(id);
            state.requests.delete(id);
            state.inflights.cancel(id)
        };
        inflight::notify(notifiers, Err(Error::Evicted));
        self.inner.statistics.record_eviction();
        tracing::debug!("[{}]: evicted {id:?}", self.inner.name);
        self.bump();
        for listener in self.eviction_listeners() {
            listener.on_evict(id);
        }
    }

    /// Evict the id and load it again.
    pub async fn reload_id(&self, id: &E::Id) -> Option<E> {
        self.evict(id);
        self.by_id_async(id).await
    }

    /// Remove all entities and request states. All pending waiters fail with [`Error::Evicted`].
    pub fn reset(&self) {
        let notifiers = {
            let mut state = self.inner.state.lock();
            state.entities.clear();
            state.requests.reset();
            state.inflights.cancel_all()
        };
        inflight::notify(notifiers, Err(Error::Evicted));
        tracing::debug!("[{}]: reset", self.inner.name);
        self.bump();
        for listener in self.eviction_listeners() {
            listener.on_reset();
        }
    }

    /// Register a listener for every failed load.
    pub fn add_error_listener(&self, listener: impl ErrorListener) -> ListenerId {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Unregister an error listener. Returns `false` if it was not registered.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Register a listener for evictions and resets, whichever handle issues them.
    pub fn add_eviction_listener(&self, listener: Arc<dyn EvictionListener<Id = E::Id>>) {
        self.inner.eviction_listeners.write().push(listener);
    }

    /// Count of cached entities.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entities.len()
    }

    /// Returns `true` if no entity is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Load counters of the cache.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    /// Subscribe to changes of the cache.
    ///
    /// The revision is bumped after every mutation of cached entities or request states.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub(crate) fn listeners(&self) -> &ErrorListeners {
        &self.inner.listeners
    }

    pub(crate) fn spawner(&self) -> &Spawner {
        &self.inner.spawner
    }

    fn eviction_listeners(&self) -> Vec<Arc<dyn EvictionListener<Id = E::Id>>> {
        self.inner.eviction_listeners.read().clone()
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    fn load(&self, id: &E::Id, wait: bool) -> Load<Outcome> {
        let ticket = {
            let mut state = self.inner.state.lock();
            match state.requests.status(id) {
                RequestStatus::Done => {
                    self.inner.statistics.record_hit();
                    return Load::Ready;
                }
                // A failed id is never retried implicitly, only `evict` or `reload_id` clears it.
                RequestStatus::Error => return Load::Ready,
                RequestStatus::InProgress if wait => return Load::Wait(state.inflights.wait(id.clone())),
                RequestStatus::InProgress => return Load::Ready,
                RequestStatus::None | RequestStatus::NotFound => {
                    state.requests.set_status(id.clone(), RequestStatus::InProgress, None);
                    state.inflights.launch(id.clone())
                }
            }
        };
        self.bump();
        self.inner.statistics.record_fetch();
        tracing::debug!("[{}]: fetch {id:?}, ticket: {ticket}", self.inner.name);

        let future = self.inner.fetcher.fetch(id.clone());
        let this = self.clone();
        let id = id.clone();
        Load::Fetch(self.inner.spawner.spawn(async move {
            let res = future.await;
            this.complete(id, ticket, res);
        }))
    }

    fn complete(&self, id: E::Id, ticket: u64, res: anyhow::Result<Option<E>>) {
        let res = match res {
            Ok(Some(entity)) if entity.id() != id => Err(Error::identity_mismatch(&id, &entity.id())),
            Ok(entity) => Ok(entity),
            Err(e) => Err(Error::fetch(e)),
        };

        let mut state = self.inner.state.lock();
        if !state.inflights.finish(&id, ticket) {
            drop(state);
            self.inner.statistics.record_stale();
            tracing::debug!(
                "[{}]: discard stale fetch result of {id:?}, ticket: {ticket}",
                self.inner.name
            );
            return;
        }

        match res {
            Ok(Some(entity)) => {
                state.requests.set_status(id.clone(), RequestStatus::Done, None);
                state.entities.insert(id.clone(), entity);
                let notifiers = state.inflights.take_all(&id);
                drop(state);
                inflight::notify(notifiers, Ok(Outcome::Done));
            }
            Ok(None) => {
                state.requests.set_status(id.clone(), RequestStatus::NotFound, None);
                let notifiers = state.inflights.take(&id);
                drop(state);
                self.inner.statistics.record_not_found();
                tracing::debug!("[{}]: {id:?} not found", self.inner.name);
                inflight::notify(notifiers, Ok(Outcome::NotFound));
            }
            Err(e) => {
                state
                    .requests
                    .set_status(id.clone(), RequestStatus::Error, Some(e.clone()));
                let notifiers = state.inflights.take_all(&id);
                drop(state);
                self.inner.statistics.record_failure();
                tracing::warn!("[{}]: error raised when fetching {id:?}, error: {e}", self.inner.name);
                inflight::notify(notifiers, Err(e.clone()));
                self.inner.listeners.notify(&e);
            }
        }
        self.bump();
    }
}
