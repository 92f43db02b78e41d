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

pub use recall_common::{
    error::{Error, Result},
    key::{json_key, Entity, Key, QueryKey},
    listener::{ErrorListener, EvictionListener, ListenerId},
    request_state::{RequestEntry, RequestStates, RequestStatus, StateFactory},
    spawn::{SpawnHandle, Spawner},
    statistics::{Statistics, StatisticsSnapshot},
};

pub use crate::{
    entity::{EntityCache, EntityCacheBuilder, EntityFetcher},
    query::{FetchByQueryResult, QueryCache, QueryCacheBuilder, QueryFetcher},
};
