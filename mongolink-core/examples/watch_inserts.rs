// Copyright 2026 Mongolink Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! Watch Inserts Example
//!
//! Connects to a MongoDB replica set, prints the logical id of every job
//! inserted into `Factory.Jobs`, and keeps doing so across server restarts.
//!
//! # Prerequisites
//!
//! ```bash
//! docker run -d --name mongodb -p 27017:27017 mongo:7 --replSet rs0
//! docker exec mongodb mongosh --eval "rs.initiate()"
//! ```
//!
//! # Running the Example
//!
//! ```bash
//! cargo run --example watch_inserts
//! ```
//!
//! # Generate Test Data
//!
//! In another terminal:
//! ```bash
//! docker exec mongodb mongosh Factory --eval '
//!   db.Jobs.insertOne({id: NumberLong(1), product_id: NumberLong(42)})
//! '
//! ```
//!
//! Restart the container (`docker restart mongodb`) to watch the link
//! reconnect and the watcher resubscribe.

use mongolink_core::link::{Link, LinkConfig};
use mongolink_core::Namespace;
use std::error::Error;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let uri = std::env::var("MONGODB_URI").unwrap_or_else(|_| {
        "mongodb://localhost:27017/?replicaSet=rs0&directConnection=true".to_string()
    });

    let config = LinkConfig::builder()
        .uri(uri)
        .reconnect_backoff(Duration::from_secs(2))
        .build()?;

    let link = Link::builder(config)
        .on_reconnected(|| async {
            info!("Link re-established");
        })
        .build();

    // A failed first connect is fine: the supervisor keeps retrying.
    if let Err(e) = link.connect().await {
        info!(error = %e, "Initial connect failed, waiting for the server");
    }

    let jobs = Namespace::new("Factory", "Jobs");
    let watching = link.clone();
    let watcher = tokio::spawn(async move {
        watching
            .watch_inserts(&jobs, |id| info!(id, "Job inserted"))
            .await;
    });

    info!("Watching Factory.Jobs, press Ctrl+C to stop");
    signal::ctrl_c().await?;

    info!("Received shutdown signal");
    link.shutdown().await;
    watcher.await?;
    link.disconnect().await?;

    Ok(())
}

/// Initialize structured logging
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mongolink_core=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
