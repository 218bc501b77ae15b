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

//! Change feed watcher.
//!
//! A [`ChangeWatcher`] turns a collection's change feed into a sequence of
//! [`ChangeNotice`]s, each naming the operation and the logical id of the
//! affected record. It runs until the link is shut down:
//!
//! 1. Acquire a verified collection handle from the link.
//! 2. Subscribe to the feed, filtered to the configured operation types.
//! 3. For each event, read the logical id from the post-image (insert,
//!    update, replace) or the pre-image (delete) and call the handler.
//! 4. When the feed fails or ends, drop it, wait `retry_delay` and start
//!    over from step 1.
//!
//! Events whose id is missing or not an integer are logged and skipped; they
//! never stop the loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongolink_core::event::{Namespace, OperationType};
//! use mongolink_core::link::Link;
//! use mongolink_core::watcher::WatchConfig;
//!
//! # async fn example(link: Link) -> Result<(), Box<dyn std::error::Error>> {
//! let config = WatchConfig::builder()
//!     .operations(vec![OperationType::Insert, OperationType::Delete])
//!     .build()?;
//!
//! link.watcher_with_config(&Namespace::new("Headquarters", "Jobs"), config)
//!     .run(|notice| println!("{} {}", notice.operation, notice.id))
//!     .await;
//! # Ok(())
//! # }
//! ```

use crate::codec::{DocumentCodec, LogicalId};
use crate::driver::FeedFilter;
use crate::event::{ChangeEvent, Namespace, OperationType};
use crate::link::{Link, LinkError};
use crate::metrics::{self, ErrorCategory};
use bson::Document;
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// A logical-id notification for one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Kind of change
    pub operation: OperationType,

    /// Logical id of the affected record
    pub id: LogicalId,
}

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Operation types to deliver
    pub operations: Vec<OperationType>,

    /// Wait before re-acquiring the collection after a failure
    pub retry_delay: Duration,

    /// Batch size for fetching events
    pub batch_size: Option<u32>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            operations: vec![OperationType::Insert],
            retry_delay: Duration::from_secs(5),
            batch_size: None,
        }
    }
}

impl WatchConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Configuration`] if no operation is configured, an
    /// operation carries no document image, or `retry_delay` is zero.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.operations.is_empty() {
            return Err(LinkError::Configuration(
                "at least one operation type must be watched".to_string(),
            ));
        }

        if let Some(operation) = self.operations.iter().find(|op| !op.carries_document()) {
            return Err(LinkError::Configuration(format!(
                "{operation} events carry no document to read a logical id from"
            )));
        }

        if self.retry_delay.is_zero() {
            return Err(LinkError::Configuration(
                "retry_delay must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == Some(0) {
            return Err(LinkError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn feed_filter(&self) -> FeedFilter {
        let mut filter = FeedFilter::for_operations(self.operations.clone());
        filter.batch_size = self.batch_size;
        filter
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug, Default)]
pub struct WatchConfigBuilder {
    operations: Vec<OperationType>,
    retry_delay: Option<Duration>,
    batch_size: Option<u32>,
}

impl WatchConfigBuilder {
    /// Replaces the watched operation types (default: insert only).
    #[must_use]
    pub fn operations(mut self, operations: Vec<OperationType>) -> Self {
        self.operations = operations;
        self
    }

    /// Adds one watched operation type.
    #[must_use]
    pub fn watch(mut self, operation: OperationType) -> Self {
        if !self.operations.contains(&operation) {
            self.operations.push(operation);
        }
        self
    }

    /// Sets the wait between resubscriptions (default: 5s).
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the batch size for fetching events.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// See [`WatchConfig::validate`].
    pub fn build(self) -> Result<WatchConfig, LinkError> {
        let defaults = WatchConfig::default();
        let config = WatchConfig {
            operations: if self.operations.is_empty() {
                defaults.operations
            } else {
                self.operations
            },
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            batch_size: self.batch_size,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Delivers change notices for one collection.
#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    link: Link,
    namespace: Namespace,
    config: WatchConfig,
    filter: FeedFilter,
}

impl ChangeWatcher {
    /// Creates an insert-only watcher.
    pub fn new(link: Link, namespace: Namespace) -> Self {
        Self::with_config(link, namespace, WatchConfig::default())
    }

    /// Creates a watcher with custom settings.
    pub fn with_config(link: Link, namespace: Namespace, config: WatchConfig) -> Self {
        let filter = config.feed_filter();
        Self {
            link,
            namespace,
            config,
            filter,
        }
    }

    /// Watched namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Watcher settings.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Runs the watch loop, calling `handler` for every change.
    ///
    /// Returns once the link is shut down. Acquisition and feed failures
    /// are logged and retried after `retry_delay`.
    #[instrument(skip(self, handler), fields(namespace = %self.namespace))]
    pub async fn run<F>(&self, mut handler: F)
    where
        F: FnMut(ChangeNotice) + Send,
    {
        let shutdown = self.link.shutdown_token();
        let codec = self.link.codec().clone();
        info!(operations = ?self.config.operations, "Starting change watcher");

        while !shutdown.is_cancelled() {
            let collection = match self.link.collection(&self.namespace).await {
                Ok(collection) => collection,
                Err(e) => {
                    warn!(error = %e, "Failed to acquire collection, retrying");
                    if !self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let mut feed = match collection.watch(&self.filter).await {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to change feed, retrying");
                    drop(collection);
                    if !self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            debug!("Subscribed to change feed");

            loop {
                let item = tokio::select! {
                    () = shutdown.cancelled() => {
                        info!("Change watcher stopped");
                        return;
                    }
                    item = feed.next() => item,
                };

                match item {
                    Some(Ok(envelope)) => self.dispatch(&codec, envelope, &mut handler),
                    Some(Err(e)) => {
                        warn!(error = %e, "Change feed failed, resubscribing");
                        break;
                    }
                    None => {
                        warn!("Change feed ended, resubscribing");
                        break;
                    }
                }
            }

            drop(feed);
            drop(collection);
            metrics::increment_feed_resubscriptions(&self.namespace.collection);

            if !self.pause(&shutdown).await {
                break;
            }
        }

        info!("Change watcher stopped");
    }

    /// Waits `retry_delay`. Returns false if the link was shut down instead.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = tokio::time::sleep(self.config.retry_delay) => true,
        }
    }

    fn dispatch<F>(&self, codec: &DocumentCodec, envelope: Document, handler: &mut F)
    where
        F: FnMut(ChangeNotice),
    {
        let collection = &self.namespace.collection;

        let event = match ChangeEvent::try_from(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed change event");
                metrics::increment_change_events_skipped(collection, ErrorCategory::Serialization);
                return;
            }
        };

        if !self.filter.accepts(&event.operation) {
            trace!(operation = %event.operation, "Ignoring unwatched change event");
            return;
        }

        match event.logical_id(codec) {
            Ok(id) => {
                trace!(operation = %event.operation, id, "Delivering change notice");
                metrics::increment_change_notices_delivered(collection, event.operation.as_str());
                handler(ChangeNotice {
                    operation: event.operation,
                    id,
                });
            }
            Err(e) => {
                warn!(operation = %event.operation, error = %e, "Skipping corrupted change event");
                metrics::increment_change_events_skipped(
                    collection,
                    ErrorCategory::CorruptedDocument,
                );
            }
        }
    }
}
