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

#[derive(Debug, Clone)]
struct Document {
    path: String,
}

impl Entity for Document {
    type Id = String;

    fn id(&self) -> String {
        self.path.clone()
    }
}

/// Output:
///
/// ```plain
/// load failed: fetch failed: storage offline: /etc/motd
/// status: Error
/// wait_for_id: Err(Fetch(storage offline: /etc/motd))
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let documents = EntityCacheBuilder::new(|path: String| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        anyhow::Result::<Option<Document>>::Err(anyhow::anyhow!("storage offline: {path}"))
    })
    .with_error_listener(|e: &Error| println!("load failed: {e}"))
    .build();

    let path = "/etc/motd".to_string();
    let wait = tokio::spawn({
        let documents = documents.clone();
        let path = path.clone();
        async move { documents.wait_for_id(&path).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(documents.by_id_async(&path).await.is_none());
    println!("status: {:?}", documents.status(&path));
    println!("wait_for_id: {:?}", wait.await?);

    Ok(())
}
