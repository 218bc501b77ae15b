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

//! In-memory driver implementation.
//!
//! [`MemoryDriver`] keeps collections in process and emits change feed
//! envelopes shaped like the server's. It is intended for:
//!
//! - **Tests** - no database required
//! - **Local development** - exercising reconnect and watch behavior
//!
//! The driver also exposes fault injection so outages can be simulated
//! deterministically:
//!
//! - [`MemoryDriver::fail_next_dials`] makes client creation fail
//! - [`MemoryDriver::set_reachable`] makes pings fail and breaks live feeds
//! - [`MemoryDriver::fail_next_subscriptions`] makes `watch` calls fail
//! - [`MemoryDriver::break_feeds`] ends every live feed on a collection
//! - [`MemoryDriver::inject_event`] pushes a raw envelope to subscribers
//!
//! # Limitations
//!
//! - **No persistence** - data is lost when the driver is dropped
//! - **Equality filters only** - top-level `{ field: value }` matching
//!
//! # Example
//!
//! ```rust
//! use mongolink_core::driver::Driver;
//! use mongolink_core::event::Namespace;
//! use mongolink_core::memory::MemoryDriver;
//! use bson::doc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = MemoryDriver::new();
//! let connection = driver.dial("memory://local", Duration::from_secs(1)).await?;
//! connection.ping().await?;
//!
//! let orders = connection.collection(&Namespace::new("Headquarters", "Orders"));
//! orders.insert_one(doc! { "id": 1_i64 }).await?;
//! assert_eq!(driver.documents(&Namespace::new("Headquarters", "Orders")).len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::driver::{ChangeFeed, CollectionHandle, Connection, Driver, DriverError, FeedFilter};
use crate::event::{Namespace, OperationType};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document, Timestamp};
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

const HOST_UNREACHABLE: i32 = 6;
const DUPLICATE_KEY: i32 = 11000;

type FeedSender = mpsc::UnboundedSender<Result<Document, DriverError>>;

/// In-memory backing store with fault injection.
///
/// Cloning the driver shares the same store, so a test can keep a clone to
/// inspect state and inject faults while a link owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    collections: Mutex<HashMap<Namespace, CollectionState>>,
    faults: Mutex<Faults>,
    dial_attempts: AtomicUsize,
    writes: AtomicUsize,
    next_connection: AtomicU64,
    next_event: AtomicU64,
}

#[derive(Debug, Default)]
struct Faults {
    failing_dials: usize,
    unreachable: bool,
    failing_subscriptions: usize,
    index_error: Option<i32>,
}

#[derive(Debug, Default)]
struct CollectionState {
    documents: Vec<Document>,
    unique_fields: Vec<String>,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    connection: u64,
    filter: FeedFilter,
    sender: FeedSender,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Poisoning only happens if a test panicked mid-update.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn unreachable_error() -> DriverError {
    DriverError::new("server selection timed out: no reachable servers")
        .with_code(HOST_UNREACHABLE)
        .with_labels(vec!["NetworkError".to_string()])
}

fn closed_error() -> DriverError {
    DriverError::new("client has been closed").with_code(HOST_UNREACHABLE)
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        // Precision loss above 2^53 is irrelevant for test data.
        #[allow(clippy::cast_precision_loss)]
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn values_equal(left: &Bson, right: &Bson) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => left == right,
    }
}

fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        document
            .get(key)
            .is_some_and(|actual| values_equal(actual, expected))
    })
}

impl MemoryDriver {
    /// Creates an empty, reachable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` dial attempts fail.
    pub fn fail_next_dials(&self, count: usize) {
        lock(&self.shared.faults).failing_dials = count;
    }

    /// Toggles server reachability.
    ///
    /// While unreachable, pings fail. Going unreachable also breaks every
    /// live change feed, as a dropped network connection would.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.shared.faults).unreachable = !reachable;
        if !reachable {
            let mut collections = lock(&self.shared.collections);
            for state in collections.values_mut() {
                for subscriber in state.subscribers.drain(..) {
                    let _ = subscriber.sender.unbounded_send(Err(unreachable_error()));
                }
            }
        }
    }

    /// Makes the next `count` change feed subscriptions fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        lock(&self.shared.faults).failing_subscriptions = count;
    }

    /// Makes the next unique index creation fail with the given server code.
    pub fn fail_next_index_creation(&self, code: i32) {
        lock(&self.shared.faults).index_error = Some(code);
    }

    /// Ends every live change feed on `namespace` with an error.
    pub fn break_feeds(&self, namespace: &Namespace) {
        let mut collections = lock(&self.shared.collections);
        if let Some(state) = collections.get_mut(namespace) {
            for subscriber in state.subscribers.drain(..) {
                let _ = subscriber.sender.unbounded_send(Err(DriverError::new(
                    "change stream cursor was killed",
                )
                .with_code(43)));
            }
        }
    }

    /// Delivers a raw envelope to every live subscriber of `namespace`,
    /// bypassing the subscription's operation filter.
    pub fn inject_event(&self, namespace: &Namespace, envelope: Document) {
        let mut collections = lock(&self.shared.collections);
        if let Some(state) = collections.get_mut(namespace) {
            state
                .subscribers
                .retain(|s| s.sender.unbounded_send(Ok(envelope.clone())).is_ok());
        }
    }

    /// Number of dial attempts since creation or the last reset.
    pub fn dial_attempts(&self) -> usize {
        self.shared.dial_attempts.load(Ordering::SeqCst)
    }

    /// Resets the dial attempt counter.
    pub fn reset_dial_attempts(&self) {
        self.shared.dial_attempts.store(0, Ordering::SeqCst);
    }

    /// Number of successful write operations.
    pub fn writes(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Number of live change feeds on `namespace`.
    pub fn subscriber_count(&self, namespace: &Namespace) -> usize {
        let mut collections = lock(&self.shared.collections);
        collections.get_mut(namespace).map_or(0, |state| {
            state.subscribers.retain(|s| !s.sender.is_closed());
            state.subscribers.len()
        })
    }

    /// Snapshot of the documents stored in `namespace`, in insertion order.
    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        lock(&self.shared.collections)
            .get(namespace)
            .map(|state| state.documents.clone())
            .unwrap_or_default()
    }

    /// Fields with a unique index on `namespace`.
    pub fn unique_indexes(&self, namespace: &Namespace) -> Vec<String> {
        lock(&self.shared.collections)
            .get(namespace)
            .map(|state| state.unique_fields.clone())
            .unwrap_or_default()
    }

    fn is_reachable(&self) -> bool {
        !lock(&self.shared.faults).unreachable
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn dial(
        &self,
        uri: &str,
        _server_selection_timeout: Duration,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        self.shared.dial_attempts.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = lock(&self.shared.faults);
            if faults.failing_dials > 0 {
                faults.failing_dials -= 1;
                return Err(DriverError::new(format!("failed to create client for {uri}"))
                    .with_code(HOST_UNREACHABLE));
            }
        }

        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "Opened in-memory connection");

        Ok(Arc::new(MemoryConnection {
            driver: self.clone(),
            state: Arc::new(ConnectionState {
                id,
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

#[derive(Debug)]
struct ConnectionState {
    id: u64,
    closed: AtomicBool,
}

impl ConnectionState {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }
}

/// Connection to a [`MemoryDriver`] store.
#[derive(Debug)]
pub struct MemoryConnection {
    driver: MemoryDriver,
    state: Arc<ConnectionState>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&self) -> Result<(), DriverError> {
        self.state.check_open()?;
        if self.driver.is_reachable() {
            Ok(())
        } else {
            Err(unreachable_error())
        }
    }

    fn collection(&self, namespace: &Namespace) -> Arc<dyn CollectionHandle> {
        Arc::new(MemoryCollection {
            driver: self.driver.clone(),
            connection: Arc::clone(&self.state),
            namespace: namespace.clone(),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Feeds opened through this client die with it.
        let mut collections = lock(&self.driver.shared.collections);
        for state in collections.values_mut() {
            state.subscribers.retain(|s| {
                if s.connection == self.state.id {
                    let _ = s.sender.unbounded_send(Err(closed_error()));
                    false
                } else {
                    true
                }
            });
        }
        debug!(connection = self.state.id, "Closed in-memory connection");
        Ok(())
    }
}

/// Collection handle on a [`MemoryDriver`] store.
#[derive(Debug)]
pub struct MemoryCollection {
    driver: MemoryDriver,
    connection: Arc<ConnectionState>,
    namespace: Namespace,
}

impl MemoryCollection {
    fn next_envelope(&self, operation: &OperationType, document_key: Bson) -> Document {
        let sequence = self.driver.shared.next_event.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        let cluster_time = Timestamp {
            time: u32::try_from(now).unwrap_or(u32::MAX),
            increment: u32::try_from(sequence).unwrap_or(u32::MAX),
        };

        doc! {
            "_id": { "_data": format!("{sequence:016x}") },
            "operationType": operation.as_str(),
            "clusterTime": cluster_time,
            "ns": {
                "db": self.namespace.database.as_str(),
                "coll": self.namespace.collection.as_str(),
            },
            "documentKey": { "_id": document_key },
        }
    }

    fn check_unique(
        state: &CollectionState,
        document: &Document,
        skip: Option<usize>,
    ) -> Result<(), DriverError> {
        for field in &state.unique_fields {
            let Some(value) = document.get(field) else {
                continue;
            };
            let clash = state.documents.iter().enumerate().any(|(index, existing)| {
                Some(index) != skip
                    && existing
                        .get(field)
                        .is_some_and(|other| values_equal(other, value))
            });
            if clash {
                return Err(DriverError::new(format!(
                    "E11000 duplicate key error: {field} {value}"
                ))
                .with_code(DUPLICATE_KEY));
            }
        }
        Ok(())
    }

    fn publish(
        state: &mut CollectionState,
        operation: &OperationType,
        envelope: &Document,
        pre_image: Option<&Document>,
        post_image: Option<&Document>,
    ) {
        state.subscribers.retain(|subscriber| {
            if !subscriber.filter.accepts(operation) {
                return !subscriber.sender.is_closed();
            }

            let mut event = envelope.clone();
            if let Some(post_image) = post_image {
                event.insert("fullDocument", post_image.clone());
            }
            if let Some(pre_image) = pre_image {
                if subscriber.filter.full_document_before_change {
                    event.insert("fullDocumentBeforeChange", pre_image.clone());
                }
            }
            subscriber.sender.unbounded_send(Ok(event)).is_ok()
        });
    }

    fn insert_locked(
        &self,
        state: &mut CollectionState,
        document: Document,
    ) -> Result<(), DriverError> {
        let mut stored = Document::new();
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => Bson::ObjectId(ObjectId::new()),
        };
        stored.insert("_id", id.clone());
        stored.extend(document);

        Self::check_unique(state, &stored, None)?;

        let envelope = self.next_envelope(&OperationType::Insert, id);
        Self::publish(state, &OperationType::Insert, &envelope, None, Some(&stored));
        state.documents.push(stored);
        self.driver.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_available(&self) -> Result<(), DriverError> {
        self.connection.check_open()?;
        if self.driver.is_reachable() {
            Ok(())
        } else {
            Err(unreachable_error())
        }
    }
}

#[async_trait]
impl CollectionHandle for MemoryCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn create_unique_index(&self, field: &str) -> Result<(), DriverError> {
        self.check_available()?;

        if let Some(code) = lock(&self.driver.shared.faults).index_error.take() {
            return Err(
                DriverError::new(format!("index creation on {field} failed")).with_code(code)
            );
        }

        let mut collections = lock(&self.driver.shared.collections);
        let state = collections.entry(self.namespace.clone()).or_default();
        if !state.unique_fields.iter().any(|f| f == field) {
            state.unique_fields.push(field.to_string());
            trace!(namespace = %self.namespace, field, "Created unique index");
        }
        Ok(())
    }

    async fn insert_one(&self, document: Document) -> Result<(), DriverError> {
        self.check_available()?;
        let mut collections = lock(&self.driver.shared.collections);
        let state = collections.entry(self.namespace.clone()).or_default();
        self.insert_locked(state, document)
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<(), DriverError> {
        self.check_available()?;
        let mut collections = lock(&self.driver.shared.collections);
        let state = collections.entry(self.namespace.clone()).or_default();
        // Ordered semantics: stop at the first failing document.
        for document in documents {
            self.insert_locked(state, document)?;
        }
        Ok(())
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
    ) -> Result<u64, DriverError> {
        self.check_available()?;
        let mut collections = lock(&self.driver.shared.collections);
        let state = collections.entry(self.namespace.clone()).or_default();

        let Some(index) = state
            .documents
            .iter()
            .position(|document| matches_filter(document, &filter))
        else {
            return Ok(0);
        };

        let id = state.documents[index]
            .get("_id")
            .cloned()
            .unwrap_or(Bson::Null);
        let mut stored = Document::new();
        stored.insert("_id", id.clone());
        stored.extend(replacement.into_iter().filter(|(key, _)| key != "_id"));

        Self::check_unique(state, &stored, Some(index))?;

        let envelope = self.next_envelope(&OperationType::Replace, id);
        Self::publish(state, &OperationType::Replace, &envelope, None, Some(&stored));
        state.documents[index] = stored;
        self.driver.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, DriverError> {
        self.check_available()?;
        let mut collections = lock(&self.driver.shared.collections);
        let state = collections.entry(self.namespace.clone()).or_default();

        let (removed, kept): (Vec<Document>, Vec<Document>) = std::mem::take(&mut state.documents)
            .into_iter()
            .partition(|document| matches_filter(document, &filter));
        state.documents = kept;

        for document in &removed {
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            let envelope = self.next_envelope(&OperationType::Delete, id);
            Self::publish(state, &OperationType::Delete, &envelope, Some(document), None);
        }

        if !removed.is_empty() {
            self.driver.shared.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed.len() as u64)
    }

    async fn find(&self, filter: Document) -> Result<Vec<Document>, DriverError> {
        self.check_available()?;
        Ok(lock(&self.driver.shared.collections)
            .get(&self.namespace)
            .map(|state| {
                state
                    .documents
                    .iter()
                    .filter(|document| matches_filter(document, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_last(&self) -> Result<Option<Document>, DriverError> {
        self.check_available()?;
        Ok(lock(&self.driver.shared.collections)
            .get(&self.namespace)
            .and_then(|state| state.documents.last().cloned()))
    }

    async fn watch(&self, filter: &FeedFilter) -> Result<ChangeFeed, DriverError> {
        self.check_available()?;

        {
            let mut faults = lock(&self.driver.shared.faults);
            if faults.failing_subscriptions > 0 {
                faults.failing_subscriptions -= 1;
                return Err(
                    DriverError::new("failed to open change stream").with_code(HOST_UNREACHABLE)
                );
            }
        }

        let (sender, receiver) = mpsc::unbounded();
        let mut collections = lock(&self.driver.shared.collections);
        collections
            .entry(self.namespace.clone())
            .or_default()
            .subscribers
            .push(Subscriber {
                connection: self.connection.id,
                filter: filter.clone(),
                sender,
            });
        debug!(namespace = %self.namespace, "Opened in-memory change feed");

        Ok(receiver.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeEvent;

    fn orders() -> Namespace {
        Namespace::new("Headquarters", "Orders")
    }

    async fn collection(driver: &MemoryDriver) -> Arc<dyn CollectionHandle> {
        driver
            .dial("memory://test", Duration::from_millis(10))
            .await
            .unwrap()
            .collection(&orders())
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let driver = MemoryDriver::new();
        let coll = collection(&driver).await;

        coll.insert_one(doc! { "id": 1_i64, "status": "open" }).await.unwrap();
        coll.insert_one(doc! { "id": 2_i64, "status": "done" }).await.unwrap();

        let open = coll.find(doc! { "status": "open" }).await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].get_object_id("_id").is_ok());

        let by_id = coll.find(doc! { "id": 2_i32 }).await.unwrap();
        assert_eq!(by_id.len(), 1, "numeric comparison ignores integer width");

        let last = coll.find_last().await.unwrap().unwrap();
        assert_eq!(last.get_i64("id").unwrap(), 2);
        assert_eq!(driver.writes(), 2);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let driver = MemoryDriver::new();
        let coll = collection(&driver).await;
        coll.create_unique_index("id").await.unwrap();
        coll.create_unique_index("id").await.unwrap();
        assert_eq!(driver.unique_indexes(&orders()), vec!["id".to_string()]);

        coll.insert_one(doc! { "id": 1_i64 }).await.unwrap();
        let err = coll.insert_one(doc! { "id": 1_i64 }).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(driver.documents(&orders()).len(), 1);
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let driver = MemoryDriver::new();
        let coll = collection(&driver).await;
        coll.insert_one(doc! { "id": 1_i64, "v": 1 }).await.unwrap();

        let matched = coll
            .replace_one(doc! { "id": 1_i64 }, doc! { "id": 1_i64, "v": 2 })
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(driver.documents(&orders())[0].get_i32("v").unwrap(), 2);

        let missing = coll
            .replace_one(doc! { "id": 9_i64 }, doc! { "id": 9_i64 })
            .await
            .unwrap();
        assert_eq!(missing, 0);

        assert_eq!(coll.delete_many(doc! {}).await.unwrap(), 1);
        assert!(driver.documents(&orders()).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_fails_pings_and_operations() {
        let driver = MemoryDriver::new();
        let connection = driver.dial("memory://test", Duration::from_millis(10)).await.unwrap();
        driver.set_reachable(false);

        assert!(connection.ping().await.unwrap_err().is_retryable());
        assert!(connection.collection(&orders()).find(doc! {}).await.is_err());

        driver.set_reachable(true);
        connection.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_next_dials() {
        let driver = MemoryDriver::new();
        driver.fail_next_dials(2);

        assert!(driver.dial("memory://test", Duration::ZERO).await.is_err());
        assert!(driver.dial("memory://test", Duration::ZERO).await.is_err());
        assert!(driver.dial("memory://test", Duration::ZERO).await.is_ok());
        assert_eq!(driver.dial_attempts(), 3);
    }

    #[tokio::test]
    async fn test_feed_delivers_filtered_events() {
        let driver = MemoryDriver::new();
        let coll = collection(&driver).await;
        let mut feed = coll
            .watch(&FeedFilter::for_operations(vec![OperationType::Delete]))
            .await
            .unwrap();

        coll.insert_one(doc! { "id": 4_i64 }).await.unwrap();
        coll.delete_many(doc! { "id": 4_i64 }).await.unwrap();

        let raw = feed.next().await.unwrap().unwrap();
        let event = ChangeEvent::try_from(raw).unwrap();
        assert!(event.is_delete());
        assert_eq!(
            event.full_document_before_change.unwrap().get_i64("id").unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_closing_connection_breaks_its_feeds() {
        let driver = MemoryDriver::new();
        let connection = driver.dial("memory://test", Duration::ZERO).await.unwrap();
        let mut feed = connection
            .collection(&orders())
            .watch(&FeedFilter::for_operations(vec![OperationType::Insert]))
            .await
            .unwrap();
        assert_eq!(driver.subscriber_count(&orders()), 1);

        connection.close().await.unwrap();
        assert!(feed.next().await.unwrap().is_err());
        assert!(feed.next().await.is_none());
        assert_eq!(driver.subscriber_count(&orders()), 0);
    }
}
