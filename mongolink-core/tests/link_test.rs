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

//! Link lifecycle and CRUD tests against the in-memory driver.

use bson::doc;
use futures::StreamExt;
use mongolink_core::driver::{Driver, FeedFilter};
use mongolink_core::link::{Link, LinkConfig, LinkError};
use mongolink_core::memory::MemoryDriver;
use mongolink_core::{ConnectionStatus, Namespace, OperationType};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: i64,
    customer_id: i64,
    status: String,
}

fn order(id: i64, status: &str) -> Order {
    Order {
        id,
        customer_id: 1234,
        status: status.to_string(),
    }
}

fn orders() -> Namespace {
    Namespace::new("Headquarters", "Orders")
}

fn test_config() -> LinkConfig {
    LinkConfig::builder()
        .uri("memory://test")
        .server_selection_timeout(Duration::from_millis(50))
        .health_check_timeout(Duration::from_millis(50))
        .reconnect_backoff(Duration::from_millis(20))
        .build()
        .expect("valid config")
}

fn test_link(driver: &MemoryDriver) -> Link {
    Link::builder(test_config()).driver(driver.clone()).build()
}

/// Link whose reconnected hook bumps the returned counter.
fn counting_link(driver: &MemoryDriver) -> (Link, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    let link = Link::builder(test_config())
        .driver(driver.clone())
        .on_reconnected(move || {
            let calls = Arc::clone(&hook_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    (link, calls)
}

async fn wait_for_status(link: &Link, status: ConnectionStatus) {
    timeout(Duration::from_secs(5), async {
        while link.status().await != status {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("link did not become {status}"));
}

#[tokio::test]
async fn test_connect_and_crud() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.expect("connect");
    assert_eq!(link.status().await, ConnectionStatus::Connected);
    assert!(link.is_healthy().await);

    link.add(&orders(), &order(1, "open")).await.unwrap();
    link.add(&orders(), &order(2, "open")).await.unwrap();
    assert_eq!(driver.unique_indexes(&orders()), vec!["id".to_string()]);

    let all: Vec<Order> = link.get_all(&orders()).await.unwrap();
    assert_eq!(all, vec![order(1, "open"), order(2, "open")]);

    let matched = link
        .replace_by_id(&orders(), 1, &order(1, "shipped"))
        .await
        .unwrap();
    assert_eq!(matched, 1);

    let shipped: Vec<Order> = link
        .get_filtered(&orders(), doc! { "status": "shipped" })
        .await
        .unwrap();
    assert_eq!(shipped, vec![order(1, "shipped")]);

    let latest: Option<Order> = link.get_most_recently_inserted(&orders()).await.unwrap();
    assert_eq!(latest, Some(order(2, "open")));

    assert_eq!(link.remove_by_id(&orders(), 2).await.unwrap(), 1);
    assert_eq!(link.remove_by_id(&orders(), 2).await.unwrap(), 0);
    assert_eq!(
        link.remove_by_filter(&orders(), doc! { "customer_id": 1234_i64 })
            .await
            .unwrap(),
        1
    );
    assert!(driver.documents(&orders()).is_empty());
}

#[tokio::test]
async fn test_add_many() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    let batch: Vec<Order> = (1..=5).map(|id| order(id, "open")).collect();
    link.add_many(&orders(), &batch).await.unwrap();

    let stored: Vec<Order> = link.get_all(&orders()).await.unwrap();
    assert_eq!(stored, batch);
}

#[tokio::test]
async fn test_most_recently_inserted_on_empty_collection() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    let latest: Option<Order> = link.get_most_recently_inserted(&orders()).await.unwrap();
    assert!(latest.is_none());
}

#[tokio::test]
async fn test_crud_before_connect_is_not_connected() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);

    let err = link.add(&orders(), &order(1, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));

    let err = link.get_all::<Order>(&orders()).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
    assert_eq!(driver.dial_attempts(), 0);
}

#[tokio::test]
async fn test_add_while_reconnecting_performs_no_write() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();
    link.add(&orders(), &order(1, "open")).await.unwrap();

    driver.set_reachable(false);
    assert!(link.trigger_reconnect().await);
    assert_eq!(link.status().await, ConnectionStatus::Reconnecting);

    let writes_before = driver.writes();
    let err = link.add(&orders(), &order(2, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::Reconnecting));
    assert!(err.is_transient());
    assert_eq!(driver.writes(), writes_before);
    assert_eq!(driver.documents(&orders()).len(), 1);

    link.shutdown().await;
}

#[tokio::test]
async fn test_recovery_after_dial_failures_calls_hook_once() {
    let driver = MemoryDriver::new();
    let (link, calls) = counting_link(&driver);
    link.connect().await.unwrap();

    driver.reset_dial_attempts();
    driver.fail_next_dials(3);
    assert!(link.trigger_reconnect().await);

    wait_for_status(&link, ConnectionStatus::Connected).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(driver.dial_attempts(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(link.is_healthy().await);

    link.add(&orders(), &order(1, "open")).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_start_one_loop() {
    const FAILURES: usize = 3;

    let driver = MemoryDriver::new();
    let (link, calls) = counting_link(&driver);
    link.connect().await.unwrap();

    driver.reset_dial_attempts();
    driver.fail_next_dials(FAILURES);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let link = link.clone();
            tokio::spawn(async move { link.trigger_reconnect().await })
        })
        .collect();

    let mut armed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            armed += 1;
        }
    }
    assert_eq!(armed, 1);

    wait_for_status(&link, ConnectionStatus::Connected).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(driver.dial_attempts(), FAILURES + 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_is_healthy_false_while_reconnecting() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    // The server stays reachable; only new dials fail.
    driver.fail_next_dials(usize::MAX);
    link.trigger_reconnect().await;

    assert_eq!(link.status().await, ConnectionStatus::Reconnecting);
    assert!(!link.is_healthy().await);

    link.shutdown().await;
}

#[tokio::test]
async fn test_failed_ping_during_acquisition_triggers_reconnect() {
    let driver = MemoryDriver::new();
    let (link, calls) = counting_link(&driver);
    link.connect().await.unwrap();

    driver.set_reachable(false);
    let err = link.add(&orders(), &order(1, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::HealthCheck { .. }));
    assert_eq!(link.status().await, ConnectionStatus::Reconnecting);

    driver.set_reachable(true);
    wait_for_status(&link, ConnectionStatus::Connected).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    link.add(&orders(), &order(1, "open")).await.unwrap();
    assert_eq!(driver.documents(&orders()).len(), 1);
}

#[tokio::test]
async fn test_connect_to_unreachable_server_recovers_in_background() {
    let driver = MemoryDriver::new();
    driver.set_reachable(false);
    let link = test_link(&driver);

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::HealthCheck { .. }));
    assert_eq!(link.status().await, ConnectionStatus::Reconnecting);

    driver.set_reachable(true);
    wait_for_status(&link, ConnectionStatus::Connected).await;
    assert!(link.is_healthy().await);
}

#[tokio::test]
async fn test_connect_dial_failure() {
    let driver = MemoryDriver::new();
    driver.fail_next_dials(1);
    let link = test_link(&driver);

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Dial { .. }));
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);

    link.connect().await.unwrap();
    assert_eq!(link.status().await, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);

    link.disconnect().await.unwrap();

    link.connect().await.unwrap();
    link.disconnect().await.unwrap();
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);

    let err = link.add(&orders(), &order(1, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));

    link.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_stops_supervisor() {
    let driver = MemoryDriver::new();
    let (link, calls) = counting_link(&driver);
    link.connect().await.unwrap();

    driver.set_reachable(false);
    link.trigger_reconnect().await;
    sleep(Duration::from_millis(30)).await;

    link.disconnect().await.unwrap();
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);

    driver.set_reachable(true);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_racing_triggers_leaves_no_loop_behind() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);

    for _ in 0..50 {
        driver.set_reachable(true);
        link.connect().await.unwrap();
        driver.set_reachable(false);

        let spammers: Vec<_> = (0..3)
            .map(|_| {
                let link = link.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        link.trigger_reconnect().await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        link.disconnect().await.unwrap();
        for spammer in spammers {
            spammer.await.unwrap();
        }

        assert_eq!(link.status().await, ConnectionStatus::Disconnected);
        assert!(!link.trigger_reconnect().await);
    }

    // Leave any in-flight attempt time to settle, then nothing may dial.
    sleep(Duration::from_millis(40)).await;
    let attempts = driver.dial_attempts();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.dial_attempts(), attempts);

    // The running flag was not left behind either.
    driver.set_reachable(true);
    link.connect().await.unwrap();
    driver.fail_next_dials(1);
    assert!(link.trigger_reconnect().await);
    wait_for_status(&link, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_shutdown_during_reconnect_leaves_link_disconnected() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    driver.set_reachable(false);
    assert!(link.trigger_reconnect().await);
    sleep(Duration::from_millis(30)).await;

    link.shutdown().await;
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);

    let err = link.add(&orders(), &order(1, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
    assert!(!err.is_transient());
    link.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_panicking_hook_leaves_link_usable() {
    let driver = MemoryDriver::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    let link = Link::builder(test_config())
        .driver(driver.clone())
        .on_reconnected(move || {
            let calls = Arc::clone(&hook_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                panic!("reconnected hook failed");
            }
        })
        .build();
    link.connect().await.unwrap();

    for round in 1..=2 {
        driver.fail_next_dials(2);
        assert!(link.trigger_reconnect().await);
        wait_for_status(&link, ConnectionStatus::Connected).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(calls.load(Ordering::SeqCst), round);
        assert_eq!(link.status().await, ConnectionStatus::Connected);
        assert!(link.is_healthy().await);
        link
            .add(&orders(), &order(i64::try_from(round).unwrap(), "open"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_reconnect_ends_feeds_of_replaced_client() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    let mut feed = link
        .collection(&orders())
        .await
        .unwrap()
        .watch(&FeedFilter::for_operations(vec![OperationType::Insert]))
        .await
        .unwrap();
    assert_eq!(driver.subscriber_count(&orders()), 1);

    link.connect().await.unwrap();

    assert_eq!(driver.subscriber_count(&orders()), 0);
    assert!(feed.next().await.unwrap().is_err());
    assert!(feed.next().await.is_none());
    link.add(&orders(), &order(1, "open")).await.unwrap();
}

#[tokio::test]
async fn test_trigger_on_never_connected_link_is_ignored() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);

    assert!(!link.trigger_reconnect().await);
    assert_eq!(link.status().await, ConnectionStatus::Disconnected);
    assert_eq!(driver.dial_attempts(), 0);
}

#[tokio::test]
async fn test_try_reconnecting_only_when_unhealthy() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    driver.reset_dial_attempts();
    assert!(!link.try_reconnecting().await);
    assert_eq!(driver.dial_attempts(), 0);

    driver.set_reachable(false);
    assert!(link.try_reconnecting().await);
    assert_eq!(link.status().await, ConnectionStatus::Reconnecting);

    driver.set_reachable(true);
    wait_for_status(&link, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_duplicate_logical_id_is_rejected() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    link.add(&orders(), &order(1, "open")).await.unwrap();
    let err = link.add(&orders(), &order(1, "again")).await.unwrap_err();

    match err {
        LinkError::Operation { operation, source, .. } => {
            assert_eq!(operation, "add");
            assert!(source.is_duplicate_key());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_existing_index_is_not_an_error() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    driver.fail_next_index_creation(85);
    link.add(&orders(), &order(1, "open")).await.unwrap();
}

#[tokio::test]
async fn test_index_failure_is_reported() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    driver.fail_next_index_creation(13);
    let err = link.add(&orders(), &order(1, "open")).await.unwrap_err();
    assert!(matches!(err, LinkError::Index { ref field, .. } if field == "id"));

    // The next acquisition retries the index.
    link.add(&orders(), &order(1, "open")).await.unwrap();
}

#[tokio::test]
async fn test_corrupted_document_fails_decode() {
    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();
    link.add(&orders(), &order(1, "open")).await.unwrap();

    let raw = driver
        .dial("memory://test", Duration::from_millis(50))
        .await
        .unwrap()
        .collection(&orders());
    raw.insert_one(doc! { "id": "two", "customer_id": 1_i64, "status": "open" })
        .await
        .unwrap();

    let err = link.get_all::<Order>(&orders()).await.unwrap_err();
    match err {
        LinkError::Decode(e) => assert!(e.is_corrupted_id()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_record_without_logical_id_is_rejected_before_write() {
    #[derive(Serialize)]
    struct Anonymous {
        customer_id: i64,
    }

    let driver = MemoryDriver::new();
    let link = test_link(&driver);
    link.connect().await.unwrap();

    let err = link
        .add(&orders(), &Anonymous { customer_id: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Decode(_)));
    assert_eq!(driver.writes(), 0);
}

#[tokio::test]
async fn test_custom_id_field() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ticket {
        ticket_no: i64,
        title: String,
    }

    let driver = MemoryDriver::new();
    let config = LinkConfig::builder()
        .uri("memory://test")
        .id_field("ticket_no")
        .build()
        .unwrap();
    let link = Link::builder(config).driver(driver.clone()).build();
    link.connect().await.unwrap();

    let tickets = Namespace::new("Support", "Tickets");
    link.add(
        &tickets,
        &Ticket {
            ticket_no: 10,
            title: "printer on fire".to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(driver.unique_indexes(&tickets), vec!["ticket_no".to_string()]);
    assert_eq!(link.remove_by_id(&tickets, 10).await.unwrap(), 1);
}
