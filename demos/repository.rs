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

use std::time::Duration;

use recall::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone)]
struct User {
    id: u64,
    name: String,
}

impl Entity for User {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Serialize)]
struct Search {
    prefix: String,
    limit: usize,
}

impl QueryKey for Search {
    fn query_key(&self) -> String {
        json_key(self)
    }
}

const NAMES: &[&str] = &["ada", "alan", "alonzo", "barbara", "edsger", "grace"];

async fn fetch_user(id: u64) -> anyhow::Result<Option<User>> {
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(NAMES.get(id as usize).map(|name| User {
        id,
        name: name.to_string(),
    }))
}

async fn search_users(prefix: String, limit: usize) -> anyhow::Result<FetchByQueryResult<User>> {
    tokio::time::sleep(Duration::from_millis(20)).await;
    let users = NAMES
        .iter()
        .enumerate()
        .filter(|(_, name)| name.starts_with(&prefix))
        .take(limit)
        .map(|(id, name)| User {
            id: id as u64,
            name: name.to_string(),
        })
        .collect::<Vec<_>>();
    Ok(users.into())
}

/// Output:
///
/// ```plain
/// by_query before load: []
/// by_query_async: ["ada", "alan", "alonzo"]
/// by_id from query result: Some("alan")
/// status after evicting alan: None
/// after reload: ["ada", "alan", "alonzo"]
/// missing id: None (NotFound)
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let entities = EntityCacheBuilder::new(fetch_user).with_name("users").build();
    let repository = QueryCacheBuilder::new(entities, |search: &Search| {
        search_users(search.prefix.clone(), search.limit)
    })
    .with_name("user-search")
    .build();

    let search = Search {
        prefix: "a".to_string(),
        limit: 10,
    };
    let names = |users: Vec<User>| users.into_iter().map(|user| user.name).collect::<Vec<_>>();

    println!("by_query before load: {:?}", names(repository.by_query(&search)));
    println!("by_query_async: {:?}", names(repository.by_query_async(&search).await));
    println!("by_id from query result: {:?}", repository.by_id(&1).map(|user| user.name));

    repository.evict(&1);
    println!("status after evicting alan: {:?}", repository.status(&search));
    println!("after reload: {:?}", names(repository.by_query_async(&search).await));

    let missing = repository.by_id_async(&42).await;
    println!(
        "missing id: {:?} ({:?})",
        missing.map(|user| user.name),
        repository.entities().status(&42)
    );

    tracing::info!("statistics: {:?}", repository.statistics().snapshot());

    Ok(())
}
