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

//! In-Memory Link Example with Prometheus Metrics
//!
//! Runs a link against the in-memory driver, simulates an outage, and
//! exports the link metrics to Prometheus. No database required.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run --example memory_link
//! curl http://localhost:9000/metrics | grep mongolink
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use mongolink_core::link::{Link, LinkConfig};
use mongolink_core::memory::MemoryDriver;
use mongolink_core::metrics;
use mongolink_core::watcher::WatchConfig;
use mongolink_core::{Namespace, OperationType};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: i64,
    customer_id: i64,
    status: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    metrics::init_metrics();
    let prometheus_addr: SocketAddr = ([0, 0, 0, 0], 9000).into();
    PrometheusBuilder::new()
        .with_http_listener(prometheus_addr)
        .install()?;
    info!("Prometheus metrics available at http://localhost:9000/metrics");

    let driver = MemoryDriver::new();
    let config = LinkConfig::builder()
        .uri("memory://demo")
        .reconnect_backoff(Duration::from_millis(500))
        .build()?;
    let link = Link::builder(config)
        .driver(driver.clone())
        .on_reconnected(|| async {
            info!("Link re-established");
        })
        .build();
    link.connect().await?;

    let orders = Namespace::new("Headquarters", "Orders");
    let watch_config = WatchConfig::builder()
        .operations(vec![OperationType::Insert, OperationType::Delete])
        .retry_delay(Duration::from_millis(500))
        .build()?;
    let watcher = link.watcher_with_config(&orders, watch_config);
    let watch_task = tokio::spawn(async move {
        watcher
            .run(|notice| info!(operation = %notice.operation, id = notice.id, "Change notice"))
            .await;
    });

    for id in 1..=3 {
        let order = Order {
            id,
            customer_id: 1234,
            status: "open".to_string(),
        };
        link.add(&orders, &order).await?;
    }

    warn!("Simulating a two second outage");
    driver.set_reachable(false);
    if let Err(e) = link.get_all::<Order>(&orders).await {
        info!(error = %e, "Read failed during outage");
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    driver.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    link.add(
        &orders,
        &Order {
            id: 4,
            customer_id: 1234,
            status: "open".to_string(),
        },
    )
    .await?;
    let removed = link.remove_by_id(&orders, 1).await?;
    info!(removed, status = %link.status().await, "Link recovered");

    info!("Press Ctrl+C to stop");
    signal::ctrl_c().await?;

    link.shutdown().await;
    watch_task.await?;
    link.disconnect().await?;

    Ok(())
}

/// Initialize structured logging
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mongolink_core=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}
