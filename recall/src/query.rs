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

use std::{
    fmt::Debug,
    future::Future,
    sync::{Arc, Weak},
};

use futures_util::{future::BoxFuture, FutureExt};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::Mutex;
use recall_common::{
    error::{Error, Result},
    key::{Entity, QueryKey},
    listener::{ErrorListener, EvictionListener, ListenerId},
    request_state::{RequestStates, RequestStatus},
    statistics::Statistics,
};
use tokio::sync::watch;

use crate::{
    entity::{EntityCache, Load},
    inflight::{self, InflightMap},
};

/// Result of the query fetch collaborator.
///
/// The entities are inserted into the entity cache, and their ids become the cached result of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchByQueryResult<E> {
    /// Entities satisfying the query, in result order.
    pub entities: Vec<E>,
}

impl<E> From<Vec<E>> for FetchByQueryResult<E> {
    fn from(entities: Vec<E>) -> Self {
        Self { entities }
    }
}

/// Fetch collaborator of the query cache.
pub trait QueryFetcher<Q, E>: Send + Sync + 'static
where
    E: Entity,
{
    /// Fetch the entities satisfying the query.
    fn fetch(&self, query: &Q) -> BoxFuture<'static, anyhow::Result<FetchByQueryResult<E>>>;
}

impl<Q, E, F, FU> QueryFetcher<Q, E> for F
where
    E: Entity,
    F: Fn(&Q) -> FU + Send + Sync + 'static,
    FU: Future<Output = anyhow::Result<FetchByQueryResult<E>>> + Send + 'static,
{
    fn fetch(&self, query: &Q) -> BoxFuture<'static, anyhow::Result<FetchByQueryResult<E>>> {
        self(query).boxed()
    }
}

struct QueryState<Id> {
    /// Request status per query key, the payload is the id list of the last successful load.
    requests: RequestStates<String, Vec<Id>>,
    inflights: InflightMap<String, ()>,
    /// Entity id to the query keys whose cached id list contains it.
    back_refs: HashMap<Id, HashSet<String>>,
}

impl<Id> QueryState<Id>
where
    Id: Eq + std::hash::Hash + Clone,
{
    /// Replace the id list of the key and move its back-references from the previous list to the new one.
    fn replace_ids(&mut self, key: &str, ids: Vec<Id>) {
        let previous = self.requests.state(key).cloned().unwrap_or_default();
        for id in previous.iter().filter(|id| !ids.contains(id)) {
            self.unlink(id, key);
        }
        for id in ids.iter() {
            self.back_refs.entry(id.clone()).or_default().insert(key.to_string());
        }
        self.requests.set_state(key.to_string(), ids);
    }

    /// Drop the id list of the key and all its back-references.
    fn forget(&mut self, key: &str) {
        if let Some(ids) = self.requests.state(key).cloned() {
            for id in ids.iter() {
                self.unlink(id, key);
            }
        }
        self.requests.delete(key);
    }

    fn unlink(&mut self, id: &Id, key: &str) {
        if let Some(keys) = self.back_refs.get_mut(id) {
            keys.remove(key);
            if keys.is_empty() {
                self.back_refs.remove(id);
            }
        }
    }
}

struct Inner<Q, E>
where
    E: Entity,
{
    name: String,
    entities: EntityCache<E>,
    fetcher: Arc<dyn QueryFetcher<Q, E>>,
    state: Mutex<QueryState<E::Id>>,
    statistics: Arc<Statistics>,
    revision: watch::Sender<u64>,
}

/// Builder of [`QueryCache`].
pub struct QueryCacheBuilder<Q, E>
where
    E: Entity,
{
    name: String,
    entities: EntityCache<E>,
    fetcher: Arc<dyn QueryFetcher<Q, E>>,
}

impl<Q, E> QueryCacheBuilder<Q, E>
where
    Q: QueryKey,
    E: Entity,
{
    /// Create a builder on top of the entity cache that stores the fetched entities.
    pub fn new(entities: EntityCache<E>, fetcher: impl QueryFetcher<Q, E>) -> Self {
        Self {
            name: "query".to_string(),
            entities,
            fetcher: Arc::new(fetcher),
        }
    }

    /// Set the name of the cache, used in logs.
    ///
    /// The default value is `query`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build the query cache.
    ///
    /// The query cache subscribes to evictions and resets of the entity cache, so they reset the dependent queries
    /// no matter which handle issues them.
    pub fn build(self) -> QueryCache<Q, E> {
        let (revision, _) = watch::channel(0);
        let cache = QueryCache {
            inner: Arc::new(Inner {
                name: self.name,
                entities: self.entities,
                fetcher: self.fetcher,
                state: Mutex::new(QueryState {
                    requests: RequestStates::with_factory(Vec::new),
                    inflights: InflightMap::default(),
                    back_refs: HashMap::new(),
                }),
                statistics: Arc::new(Statistics::default()),
                revision,
            }),
        };
        cache.inner.entities.add_eviction_listener(Arc::new(Cascade {
            inner: Arc::downgrade(&cache.inner),
        }));
        cache
    }
}

/// Forwards entity cache evictions to the back-reference index of a query cache.
struct Cascade<Q, E>
where
    E: Entity,
{
    inner: Weak<Inner<Q, E>>,
}

impl<Q, E> Cascade<Q, E>
where
    Q: QueryKey,
    E: Entity,
{
    fn cache(&self) -> Option<QueryCache<Q, E>> {
        self.inner.upgrade().map(|inner| QueryCache { inner })
    }
}

impl<Q, E> EvictionListener for Cascade<Q, E>
where
    Q: QueryKey,
    E: Entity,
{
    type Id = E::Id;

    fn on_evict(&self, id: &E::Id) {
        if let Some(cache) = self.cache() {
            cache.invalidate(id);
        }
    }

    fn on_reset(&self) {
        if let Some(cache) = self.cache() {
            cache.clear();
        }
    }
}

/// Cache of query results layered over an [`EntityCache`].
///
/// A query result is cached as the ordered list of entity ids, resolved through the entity cache on read. Evicting
/// an entity resets every query whose result contains it, so the next read fetches the query again.
pub struct QueryCache<Q, E>
where
    E: Entity,
{
    inner: Arc<Inner<Q, E>>,
}

impl<Q, E> Clone for QueryCache<Q, E>
where
    E: Entity,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Q, E> Debug for QueryCache<Q, E>
where
    E: Entity,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("name", &self.inner.name)
            .field("entities", &self.inner.entities)
            .finish()
    }
}

impl<Q, E> QueryCache<Q, E>
where
    Q: QueryKey,
    E: Entity,
{
    /// Return the entities of the cached query result and trigger a background load if the query is not loaded.
    ///
    /// Returns an empty list if the query never completed, or if any id of the cached result is no longer resolvable.
    pub fn by_query(&self, query: &Q) -> Vec<E> {
        let key = query.query_key();
        let _ = self.load(query, &key, false);
        self.resolve(&key)
    }

    /// Wait for the load of the query to reach a terminal status and return the entities of the result.
    ///
    /// Returns an empty list if the load fails.
    pub async fn by_query_async(&self, query: &Q) -> Vec<E> {
        let key = query.query_key();
        match self.load(query, &key, true) {
            Load::Ready => {}
            Load::Wait(waiter) => {
                if let Err(e) = inflight::wait(waiter).await {
                    tracing::debug!("[{}]: wait for query {key} ended without result, error: {e}", self.inner.name);
                }
            }
            Load::Fetch(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!("[{}]: background load of query {key} did not complete, error: {e}", self.inner.name);
                }
            }
        }
        self.resolve(&key)
    }

    /// Wait until the current or next load of the query reaches [`RequestStatus::Done`].
    ///
    /// The waiter is registered when this method is called. Fails with the stored error if the load fails, and with
    /// [`Error::Evicted`] if the query is reloaded or the cache is reset meanwhile.
    pub fn wait_for_query(&self, query: &Q) -> impl Future<Output = Result<()>> + Send + 'static {
        let waiter = self.inner.state.lock().inflights.wait(query.query_key());
        inflight::wait(waiter)
    }

    /// Discard the cached result of the query and load it again.
    pub async fn reload_query(&self, query: &Q) -> Vec<E> {
        let key = query.query_key();
        let notifiers = {
            let mut state = self.inner.state.lock();
            state.forget(&key);
            state.inflights.cancel(&key)
        };
        inflight::notify(notifiers, Err(Error::Evicted));
        self.bump();
        self.by_query_async(query).await
    }

    /// Evict the entity and reset every query whose cached result contains it.
    ///
    /// The stale id lists are kept so the next successful load can diff against them. Evicting through the entity
    /// cache has the same effect.
    pub fn evict(&self, id: &E::Id) {
        self.inner.entities.evict(id);
    }

    /// Reset the entity cache, which removes all query results and back-references.
    ///
    /// All pending waiters fail with [`Error::Evicted`]. Resetting the entity cache has the same effect.
    pub fn reset(&self) {
        self.inner.entities.reset();
    }

    /// Request status of the query.
    pub fn status(&self, query: &Q) -> RequestStatus {
        self.inner.state.lock().requests.status(&query.query_key())
    }

    /// The cached id list of the query, possibly stale.
    pub fn ids(&self, query: &Q) -> Option<Vec<E::Id>> {
        self.inner.state.lock().requests.state(&query.query_key()).cloned()
    }

    /// The query keys whose cached result contains the id.
    pub fn dependents(&self, id: &E::Id) -> Vec<String> {
        self.inner
            .state
            .lock()
            .back_refs
            .get(id)
            .map(|keys| keys.iter().cloned().sorted().collect_vec())
            .unwrap_or_default()
    }

    /// The entity cache the query results are resolved through.
    pub fn entities(&self) -> &EntityCache<E> {
        &self.inner.entities
    }

    /// See [`EntityCache::by_id`].
    pub fn by_id(&self, id: &E::Id) -> Option<E> {
        self.inner.entities.by_id(id)
    }

    /// See [`EntityCache::by_id_async`].
    pub async fn by_id_async(&self, id: &E::Id) -> Option<E> {
        self.inner.entities.by_id_async(id).await
    }

    /// See [`EntityCache::wait_for_id`].
    pub fn wait_for_id(&self, id: &E::Id) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.entities.wait_for_id(id)
    }

    /// Evict the id, which resets its dependent queries, and load it again.
    pub async fn reload_id(&self, id: &E::Id) -> Option<E> {
        self.inner.entities.reload_id(id).await
    }

    /// See [`EntityCache::add`].
    pub fn add(&self, entity: E) {
        self.inner.entities.add(entity)
    }

    /// Register a listener for every failed entity or query load.
    ///
    /// The registry is shared with the entity cache.
    pub fn add_error_listener(&self, listener: impl ErrorListener) -> ListenerId {
        self.inner.entities.add_error_listener(listener)
    }

    /// Unregister an error listener. Returns `false` if it was not registered.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.entities.remove_error_listener(id)
    }

    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Load and invalidation counters of the query cache.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    /// Subscribe to changes of the query results.
    ///
    /// Changes of the entity cache are published by [`EntityCache::subscribe`].
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    /// Reset every query whose cached result contains the id.
    fn invalidate(&self, id: &E::Id) {
        let keys = {
            let mut state = self.inner.state.lock();
            let keys = state.back_refs.remove(id).unwrap_or_default();
            for key in keys.iter() {
                state.requests.set_status(key.clone(), RequestStatus::None, None);
                self.inner.statistics.record_invalidation();
            }
            keys
        };
        if keys.is_empty() {
            return;
        }
        tracing::debug!(
            "[{}]: eviction of {id:?} invalidated queries: {:?}",
            self.inner.name,
            keys.iter().sorted().collect_vec()
        );
        self.bump();
    }

    /// Remove all query results and back-references, failing pending waiters with [`Error::Evicted`].
    fn clear(&self) {
        let notifiers = {
            let mut state = self.inner.state.lock();
            state.back_refs.clear();
            state.requests.reset();
            state.inflights.cancel_all()
        };
        inflight::notify(notifiers, Err(Error::Evicted));
        tracing::debug!("[{}]: reset", self.inner.name);
        self.bump();
    }

    fn resolve(&self, key: &str) -> Vec<E> {
        let state = self.inner.state.lock();
        let Some(ids) = state.requests.state(key) else {
            return vec![];
        };
        // A single unresolvable id marks the whole result as stale.
        ids.iter()
            .map(|id| self.inner.entities.peek(id))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default()
    }

    fn load(&self, query: &Q, key: &str, wait: bool) -> Load<()> {
        let ticket = {
            let mut state = self.inner.state.lock();
            match state.requests.status(key) {
                RequestStatus::Done => {
                    self.inner.statistics.record_hit();
                    return Load::Ready;
                }
                RequestStatus::Error => return Load::Ready,
                RequestStatus::InProgress if wait => return Load::Wait(state.inflights.wait(key.to_string())),
                RequestStatus::InProgress => return Load::Ready,
                RequestStatus::None | RequestStatus::NotFound => {
                    state
                        .requests
                        .set_status(key.to_string(), RequestStatus::InProgress, None);
                    state.inflights.launch(key.to_string())
                }
            }
        };
        self.bump();
        self.inner.statistics.record_fetch();
        tracing::debug!("[{}]: fetch query {key}, ticket: {ticket}", self.inner.name);

        let future = self.inner.fetcher.fetch(query);
        let this = self.clone();
        let key = key.to_string();
        Load::Fetch(self.inner.entities.spawner().spawn(async move {
            let res = future.await;
            this.complete(key, ticket, res);
        }))
    }

    fn complete(&self, key: String, ticket: u64, res: anyhow::Result<FetchByQueryResult<E>>) {
        let mut state = self.inner.state.lock();
        if !state.inflights.finish(&key, ticket) {
            drop(state);
            self.inner.statistics.record_stale();
            tracing::debug!(
                "[{}]: discard stale result of query {key}, ticket: {ticket}",
                self.inner.name
            );
            return;
        }

        match res {
            Ok(result) => {
                let ids = result.entities.iter().map(|entity| entity.id()).collect_vec();
                for entity in result.entities {
                    self.inner.entities.add(entity);
                }
                state.replace_ids(&key, ids);
                state.requests.set_status(key.clone(), RequestStatus::Done, None);
                let notifiers = state.inflights.take(&key);
                drop(state);
                inflight::notify(notifiers, Ok(()));
            }
            Err(e) => {
                let e = Error::fetch(e);
                state
                    .requests
                    .set_status(key.clone(), RequestStatus::Error, Some(e.clone()));
                let notifiers = state.inflights.take(&key);
                drop(state);
                self.inner.statistics.record_failure();
                tracing::warn!("[{}]: error raised when fetching query {key}, error: {e}", self.inner.name);
                inflight::notify(notifiers, Err(e.clone()));
                self.inner.entities.listeners().notify(&e);
            }
        }
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use recall_common::key::json_key;
    use serde::Serialize;

    use super::*;
    use crate::entity::EntityCacheBuilder;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestEntity {
        id: String,
        value: String,
    }

    impl Entity for TestEntity {
        type Id = String;

        fn id(&self) -> String {
            self.id.clone()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    struct TestQuery {
        search: Option<String>,
        count: Option<usize>,
    }

    impl QueryKey for TestQuery {
        fn query_key(&self) -> String {
            json_key(self)
        }
    }

    fn query() -> TestQuery {
        TestQuery {
            search: Some("some".to_string()),
            count: Some(2),
        }
    }

    fn entity(i: usize, search: &str) -> TestEntity {
        TestEntity {
            id: format!("id-{i}"),
            value: format!("value-{search}-{i}"),
        }
    }

    fn expected() -> Vec<TestEntity> {
        vec![entity(0, "some"), entity(1, "some")]
    }

    struct Fixture {
        repository: QueryCache<TestQuery, TestEntity>,
        calls: Arc<AtomicUsize>,
        /// Offset of the ids returned by the fetcher.
        offset: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let offset = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicBool::new(false));

        let entities = EntityCacheBuilder::new(|_: String| async move {
            anyhow::Result::<Option<TestEntity>>::Err(anyhow::anyhow!("Should not be reached."))
        })
        .build();

        let (c, o, f) = (calls.clone(), offset.clone(), failing.clone());
        let repository = QueryCacheBuilder::new(entities, move |query: &TestQuery| {
            c.fetch_add(1, Ordering::SeqCst);
            let offset = o.load(Ordering::SeqCst);
            let failing = f.load(Ordering::SeqCst);
            let query = query.clone();
            async move {
                if failing {
                    anyhow::bail!("Some error");
                }
                let search = query.search.unwrap_or_default();
                let entities = (offset..offset + query.count.unwrap_or(1))
                    .map(|i| entity(i, &search))
                    .collect_vec();
                Ok(FetchByQueryResult::from(entities))
            }
        })
        .with_name("test")
        .build();

        Fixture {
            repository,
            calls,
            offset,
            failing,
        }
    }

    impl Fixture {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Check the back-reference index against the cached id lists.
        fn assert_back_refs_consistent(&self, queries: &[TestQuery]) {
            for q in queries {
                if let Some(ids) = self.repository.ids(q) {
                    if self.repository.status(q) != RequestStatus::Done {
                        continue;
                    }
                    for id in ids {
                        assert!(self.repository.dependents(&id).contains(&q.query_key()));
                    }
                }
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_by_query_first_call() {
        let f = fixture();
        assert_eq!(f.repository.by_query(&query()), vec![]);
        assert_eq!(f.calls(), 1);
        assert_eq!(f.repository.status(&query()), RequestStatus::InProgress);
    }

    #[test_log::test(tokio::test)]
    async fn test_by_query_updates_after_fetch() {
        let f = fixture();
        let mut rx = f.repository.subscribe();
        let q = query();
        let wait = f.repository.wait_for_query(&q);

        assert_eq!(f.repository.by_query(&query()), vec![]);
        wait.await.unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert_eq!(f.repository.by_query(&query()), expected());
        assert_eq!(f.calls(), 1);
        assert!(!rx.has_changed().unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_query() {
        let f = fixture();
        let w1 = tokio::spawn({
            let repository = f.repository.clone();
            async move { repository.wait_for_query(&query()).await }
        });
        let w2 = tokio::spawn({
            let repository = f.repository.clone();
            async move { repository.wait_for_query(&query()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!w1.is_finished());
        assert!(!w2.is_finished());

        f.repository.by_query_async(&query()).await;
        w1.await.unwrap().unwrap();
        w2.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_query_rejected_on_reset() {
        let f = fixture();
        let w1 = tokio::spawn({
            let repository = f.repository.clone();
            async move { repository.wait_for_query(&query()).await }
        });
        let w2 = tokio::spawn({
            let repository = f.repository.clone();
            async move { repository.wait_for_query(&query()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.repository.reset();
        assert!(w1.await.unwrap().unwrap_err().is_evicted());
        assert!(w2.await.unwrap().unwrap_err().is_evicted());
    }

    #[test_log::test(tokio::test)]
    async fn test_by_query_async_during_by_query() {
        let f = fixture();
        f.repository.by_query(&query());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_by_query_async() {
        let f = fixture();
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 1);

        // Consecutive calls are answered from the cache.
        assert_eq!(f.repository.by_query(&query()), expected());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 1);
        assert_eq!(f.repository.statistics().hits(), 2);
        assert_eq!(
            f.repository.ids(&query()),
            Some(vec!["id-0".to_string(), "id-1".to_string()])
        );
        f.assert_back_refs_consistent(&[query()]);
    }

    #[test_log::test(tokio::test)]
    async fn test_reload_query() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.offset.store(3, Ordering::SeqCst);
        assert_eq!(
            f.repository.reload_query(&query()).await,
            vec![entity(3, "some"), entity(4, "some")]
        );
        assert_eq!(f.calls(), 2);

        // The old ids no longer point at the query.
        assert!(f.repository.dependents(&"id-0".to_string()).is_empty());
        assert_eq!(f.repository.dependents(&"id-3".to_string()), vec![query().query_key()]);
        f.assert_back_refs_consistent(&[query()]);
    }

    #[test_log::test(tokio::test)]
    async fn test_reset() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.repository.reset();
        assert!(f.repository.dependents(&"id-0".to_string()).is_empty());
        assert!(f.repository.entities().is_empty());
        assert_eq!(f.repository.by_query(&query()), vec![]);
        assert_eq!(f.calls(), 2);
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_reset_then_by_query_async() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.repository.reset();
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_evict_unrelated_entity() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.repository.evict(&"id-1190".to_string());
        assert_eq!(f.repository.status(&query()), RequestStatus::Done);
        assert_eq!(f.repository.by_query(&query()), expected());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 1);
        assert_eq!(f.repository.statistics().invalidations(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_evict_entity_of_query() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.repository.evict(&"id-0".to_string());
        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert!(f.repository.dependents(&"id-0".to_string()).is_empty());
        // The stale id list survives until the next load.
        assert!(f.repository.ids(&query()).is_some());

        assert_eq!(f.repository.by_query(&query()), vec![]);
        assert_eq!(f.repository.by_query(&query()), vec![]);
        assert_eq!(f.calls(), 2);
        assert_eq!(f.repository.statistics().invalidations(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_evict_entity_of_query_then_by_query_async() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;

        f.repository.evict(&"id-0".to_string());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 2);
        f.assert_back_refs_consistent(&[query()]);
    }

    #[test_log::test(tokio::test)]
    async fn test_evict_cascades_to_every_dependent_query() {
        let f = fixture();
        let small = TestQuery {
            search: Some("some".to_string()),
            count: Some(1),
        };
        let other = TestQuery {
            search: Some("other".to_string()),
            count: Some(3),
        };
        f.repository.by_query_async(&query()).await;
        f.repository.by_query_async(&small).await;
        f.repository.by_query_async(&other).await;
        assert_eq!(f.calls(), 3);

        let dependents = f.repository.dependents(&"id-0".to_string()).into_iter().collect::<BTreeSet<_>>();
        assert_eq!(
            dependents,
            [query(), small.clone(), other.clone()]
                .iter()
                .map(QueryKey::query_key)
                .collect()
        );

        // Only `other` returned `id-2`.
        f.repository.evict(&"id-2".to_string());
        assert_eq!(f.repository.status(&query()), RequestStatus::Done);
        assert_eq!(f.repository.status(&small), RequestStatus::Done);
        assert_eq!(f.repository.status(&other), RequestStatus::None);

        f.repository.evict(&"id-0".to_string());
        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert_eq!(f.repository.status(&small), RequestStatus::None);
        assert_eq!(f.repository.statistics().invalidations(), 4);

        let queries = [query(), small, other];
        for q in queries.iter() {
            f.repository.by_query_async(q).await;
        }
        assert_eq!(f.calls(), 6);
        f.assert_back_refs_consistent(&queries);
    }

    #[test_log::test(tokio::test)]
    async fn test_evict_through_entity_cache_handle() {
        let f = fixture();
        let handle = f.repository.entities().clone();
        assert_eq!(f.repository.by_query_async(&query()).await, expected());

        handle.evict(&"id-0".to_string());
        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert!(f.repository.dependents(&"id-0".to_string()).is_empty());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 2);
        assert_eq!(f.repository.statistics().invalidations(), 1);

        // `reload_id` on the entity cache evicts first, which also resets the query.
        assert_eq!(handle.reload_id(&"id-1".to_string()).await, None);
        assert_eq!(f.repository.status(&query()), RequestStatus::None);

        f.repository.by_query_async(&query()).await;
        handle.reset();
        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert!(f.repository.ids(&query()).is_none());
        assert!(f.repository.dependents(&"id-0".to_string()).is_empty());
        assert_eq!(f.repository.by_query_async(&query()).await, expected());
        assert_eq!(f.calls(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_entity_cache_outlives_query_cache() {
        let f = fixture();
        let handle = f.repository.entities().clone();
        f.repository.by_query_async(&query()).await;

        drop(f);
        handle.evict(&"id-0".to_string());
        handle.reset();
        assert!(handle.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_query_registers_before_first_poll() {
        let f = fixture();
        let q = query();

        let wait = f.repository.wait_for_query(&q);
        f.repository.by_query(&q);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.repository.status(&q), RequestStatus::Done);

        tokio::time::timeout(Duration::from_millis(500), wait)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_error_listener() {
        let f = fixture();
        f.failing.store(true, Ordering::SeqCst);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let listener = f.repository.add_error_listener(move |error: &Error| {
            assert!(matches!(error, Error::Fetch(_)));
            e.fetch_add(1, Ordering::SeqCst);
        });

        let q = TestQuery {
            search: Some("some".to_string()),
            count: None,
        };
        assert_eq!(f.repository.by_query_async(&q).await, vec![]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(f.repository.status(&q), RequestStatus::Error);

        assert!(f.repository.remove_error_listener(listener));
        assert!(f.repository.reload_query(&q).await.is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(f.calls(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_for_query_rejected_on_error() {
        let f = fixture();
        f.failing.store(true, Ordering::SeqCst);
        let q = query();
        let wait = f.repository.wait_for_query(&q);

        f.repository.by_query(&query());
        assert!(matches!(wait.await, Err(Error::Fetch(_))));
        // A failed query is not retried implicitly.
        assert_eq!(f.repository.by_query(&query()), vec![]);
        assert_eq!(f.calls(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_query_result_is_discarded() {
        let f = fixture();
        f.repository.by_query(&query());
        // Reset while the fetch is in flight.
        f.repository.reset();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert!(f.repository.entities().is_empty());
        assert_eq!(f.repository.statistics().stale(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_forwarded_entity_operations() {
        let f = fixture();
        f.repository.by_query_async(&query()).await;
        assert!(f.repository.entities().is_loaded(&"id-0".to_string()));
        // Fetched through a query, the entity is cached but its own request status is untouched.
        assert!(!f.repository.entities().is_known(&"id-0".to_string()));

        f.repository.add(TestEntity {
            id: "id-9".to_string(),
            value: "seeded".to_string(),
        });
        assert_eq!(
            f.repository.entities().peek(&"id-9".to_string()).map(|e| e.value),
            Some("seeded".to_string())
        );

        // `reload_id` goes through the entity fetcher, which fails here.
        assert_eq!(f.repository.reload_id(&"id-1".to_string()).await, None);
        assert_eq!(f.repository.status(&query()), RequestStatus::None);
        assert_eq!(f.repository.entities().status(&"id-1".to_string()), RequestStatus::Error);
    }
}
