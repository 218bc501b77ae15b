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

//! Resilient link to a MongoDB deployment.
//!
//! A [`Link`] owns one client connection and keeps it usable across network
//! interruptions and server restarts. It exposes a small typed CRUD surface
//! and the change watchers built on top of it.
//!
//! # Failure Model
//!
//! CRUD calls fail fast. If the link is not Connected they return
//! [`LinkError::NotConnected`] or [`LinkError::Reconnecting`] without
//! touching the network, so callers can choose between waiting and giving
//! up. A failed ping during collection acquisition moves the link to
//! Reconnecting and arms the background supervisor; the supervisor retries
//! forever with a fixed backoff until the server answers again.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongolink_core::event::Namespace;
//! use mongolink_core::link::Link;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Order {
//!     id: i64,
//!     customer_id: i64,
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let link = Link::new("mongodb://localhost:27017/?replicaSet=rs0", || async {
//!     tracing::info!("link is back");
//! })?;
//! link.connect().await?;
//!
//! let orders = Namespace::new("Headquarters", "Orders");
//! link.add(&orders, &Order { id: 1, customer_id: 1234 }).await?;
//!
//! let latest: Option<Order> = link.get_most_recently_inserted(&orders).await?;
//! println!("latest order: {latest:?}");
//! # Ok(())
//! # }
//! ```

use crate::codec::{CodecError, DocumentCodec, LogicalId, DEFAULT_ID_FIELD};
use crate::driver::{CollectionHandle, Driver, DriverError};
use crate::event::Namespace;
use crate::metrics::{self, ErrorCategory, Timer};
use crate::mongo::MongoDriver;
use crate::state::{ConnectionState, ConnectionStatus};
use crate::supervisor::{ReconnectSupervisor, ReconnectedHook};
use crate::watcher::{ChangeWatcher, WatchConfig};
use bson::Document;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Errors returned by [`Link`] operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The client could not be created (malformed or unreachable address)
    #[error("failed to dial {uri}: {source}")]
    Dial {
        /// Target URI
        uri: String,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The server did not answer a ping in time
    #[error("health check failed: {source}")]
    HealthCheck {
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The link has never been connected, or was disconnected
    #[error("link is not connected")]
    NotConnected,

    /// The link is recovering from a lost connection
    #[error("link is reconnecting")]
    Reconnecting,

    /// A record could not be encoded, or a stored document could not be
    /// decoded into the requested type
    #[error(transparent)]
    Decode(#[from] CodecError),

    /// The logical id unique index could not be created
    #[error("failed to ensure unique index on {namespace}.{field}: {source}")]
    Index {
        /// Namespace of the collection
        namespace: String,
        /// Indexed field
        field: String,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// A store operation failed
    #[error("{operation} on {namespace} failed: {source}")]
    Operation {
        /// Operation name
        operation: &'static str,
        /// Namespace of the collection
        namespace: String,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The client could not be closed cleanly
    #[error("failed to close client: {source}")]
    Disconnect {
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LinkError {
    /// Returns true if retrying later may succeed without caller
    /// intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Dial { .. } | Self::HealthCheck { .. } | Self::Reconnecting => true,
            Self::Operation { source, .. } => source.is_retryable(),
            Self::NotConnected
            | Self::Decode(_)
            | Self::Index { .. }
            | Self::Disconnect { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Dial { .. } | Self::Disconnect { .. } => ErrorCategory::Connection,
            Self::HealthCheck { source } => {
                if source.code() == Some(89) {
                    ErrorCategory::Timeout
                } else {
                    ErrorCategory::Connection
                }
            }
            Self::NotConnected | Self::Reconnecting => ErrorCategory::Unavailable,
            Self::Decode(e) if e.is_corrupted_id() => ErrorCategory::CorruptedDocument,
            Self::Decode(_) => ErrorCategory::Serialization,
            Self::Index { .. } | Self::Configuration(_) => ErrorCategory::Validation,
            Self::Operation { source, .. } => {
                if source.is_duplicate_key() {
                    ErrorCategory::Validation
                } else if source.is_retryable() {
                    ErrorCategory::Connection
                } else {
                    ErrorCategory::Unknown
                }
            }
        }
    }
}

/// Connection settings for a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// MongoDB connection string
    pub uri: String,

    /// How long server selection may take before a dial fails
    pub server_selection_timeout: Duration,

    /// How long a ping may take before the server counts as unreachable
    pub health_check_timeout: Duration,

    /// Fixed wait between reconnect attempts
    pub reconnect_backoff: Duration,

    /// Name of the logical id field carried by every record
    pub id_field: String,
}

impl LinkConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Configuration`] if the URI or id field is empty,
    /// or any duration is zero.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.uri.trim().is_empty() {
            return Err(LinkError::Configuration("uri must not be empty".to_string()));
        }

        if self.id_field.is_empty() {
            return Err(LinkError::Configuration(
                "id_field must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("server_selection_timeout", self.server_selection_timeout),
            ("health_check_timeout", self.health_check_timeout),
            ("reconnect_backoff", self.reconnect_backoff),
        ] {
            if value.is_zero() {
                return Err(LinkError::Configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }
}

/// Builder for [`LinkConfig`].
#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    uri: Option<String>,
    server_selection_timeout: Option<Duration>,
    health_check_timeout: Option<Duration>,
    reconnect_backoff: Option<Duration>,
    id_field: Option<String>,
}

impl LinkConfigBuilder {
    /// Sets the connection string (required).
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Sets the server selection timeout (default: 1s).
    #[must_use]
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    /// Sets the ping timeout (default: 2s).
    #[must_use]
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = Some(timeout);
        self
    }

    /// Sets the wait between reconnect attempts (default: 5s).
    #[must_use]
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = Some(backoff);
        self
    }

    /// Sets the logical id field name (default: "id").
    #[must_use]
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Configuration`] if the URI is missing or
    /// validation fails.
    pub fn build(self) -> Result<LinkConfig, LinkError> {
        let config = LinkConfig {
            uri: self
                .uri
                .ok_or_else(|| LinkError::Configuration("uri is required".to_string()))?,
            server_selection_timeout: self
                .server_selection_timeout
                .unwrap_or(Duration::from_secs(1)),
            health_check_timeout: self.health_check_timeout.unwrap_or(Duration::from_secs(2)),
            reconnect_backoff: self.reconnect_backoff.unwrap_or(Duration::from_secs(5)),
            id_field: self.id_field.unwrap_or_else(|| DEFAULT_ID_FIELD.to_string()),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`Link`].
pub struct LinkBuilder {
    config: LinkConfig,
    driver: Option<Arc<dyn Driver>>,
    on_reconnected: Option<ReconnectedHook>,
}

impl LinkBuilder {
    /// Uses `driver` instead of the MongoDB driver.
    #[must_use]
    pub fn driver(mut self, driver: impl Driver + 'static) -> Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Registers a callback run after every successful reconnect.
    ///
    /// The callback runs on its own task once the new client is installed,
    /// so the link is usable from inside it.
    #[must_use]
    pub fn on_reconnected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let on_reconnected: ReconnectedHook = Arc::new(move || hook().boxed());
        self.on_reconnected = Some(on_reconnected);
        self
    }

    /// Builds the link. Nothing is dialed until [`Link::connect`].
    #[must_use]
    pub fn build(self) -> Link {
        let driver: Arc<dyn Driver> = match self.driver {
            Some(driver) => driver,
            None => Arc::new(MongoDriver::new()),
        };

        let state = Arc::new(ConnectionState::new(
            driver,
            self.config.uri.clone(),
            self.config.server_selection_timeout,
            self.config.health_check_timeout,
        ));

        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            Arc::clone(&state),
            self.config.reconnect_backoff,
            self.on_reconnected,
            shutdown.clone(),
        );

        Link {
            inner: Arc::new(LinkInner {
                codec: DocumentCodec::new(self.config.id_field.clone()),
                config: self.config,
                state,
                supervisor,
                shutdown,
            }),
        }
    }
}

#[derive(Debug)]
struct LinkInner {
    config: LinkConfig,
    codec: DocumentCodec,
    state: Arc<ConnectionState>,
    supervisor: ReconnectSupervisor,
    shutdown: CancellationToken,
}

/// Handle to a resilient MongoDB connection.
///
/// Cloning is cheap; clones share the same connection and supervisor.
#[derive(Debug, Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    /// Creates a link to `uri` using the MongoDB driver and default
    /// settings, with a callback run after every successful reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Configuration`] if `uri` is empty.
    pub fn new<F, Fut>(uri: impl Into<String>, on_reconnected: F) -> Result<Self, LinkError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = LinkConfig::builder().uri(uri).build()?;
        Ok(Self::builder(config).on_reconnected(on_reconnected).build())
    }

    /// Starts building a link from `config`.
    #[must_use]
    pub fn builder(config: LinkConfig) -> LinkBuilder {
        LinkBuilder {
            config,
            driver: None,
            on_reconnected: None,
        }
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Codec used for records stored through this link.
    pub fn codec(&self) -> &DocumentCodec {
        &self.inner.codec
    }

    /// Dials the server and verifies it with a ping.
    ///
    /// If the ping fails, the client is kept, the supervisor is armed to
    /// recover in the background, and the ping error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Dial`], [`LinkError::HealthCheck`], or
    /// [`LinkError::Reconnecting`] if a recovery is already under way.
    #[instrument(skip(self), fields(uri = %self.inner.config.uri))]
    pub async fn connect(&self) -> Result<(), LinkError> {
        if self.status().await == ConnectionStatus::Reconnecting {
            return Err(LinkError::Reconnecting);
        }

        let state = &self.inner.state;
        let client = state.dial().await?;
        let ping = state.ping(client.as_ref()).await;

        // The old client is closed before the new one goes in.
        let previous = state.write().await.client.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Failed to close replaced client");
            }
        }

        let mut guard = state.write().await;
        if guard.status() == ConnectionStatus::Reconnecting {
            drop(guard);
            if let Err(e) = client.close().await {
                debug!(error = %e, "Failed to close client dialed during a reconnect");
            }
            return Err(LinkError::Reconnecting);
        }
        guard.install(client);
        drop(guard);

        match ping {
            Ok(()) => {
                info!("Connected");
                Ok(())
            }
            Err(source) => {
                warn!(error = %source, "Initial health check failed, reconnecting in background");
                self.inner.supervisor.trigger().await;
                Err(LinkError::HealthCheck { source })
            }
        }
    }

    /// Marks the link Disconnected, stops the supervisor and closes the
    /// client.
    ///
    /// Disconnecting a link that holds no client succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disconnect`] if the client did not close cleanly.
    /// The link is Disconnected either way.
    #[instrument(skip(self), fields(uri = %self.inner.config.uri))]
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        // Disconnected first, so no trigger can arm a loop behind the stop.
        let client = self.inner.state.teardown().await;
        self.inner.supervisor.stop().await;

        if let Some(client) = client {
            client
                .close()
                .await
                .map_err(|source| LinkError::Disconnect { source })?;
        }
        Ok(())
    }

    /// Returns true if the link is Connected and the server answers a ping.
    pub async fn is_healthy(&self) -> bool {
        self.inner.state.is_healthy().await
    }

    /// Current status.
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.status().await
    }

    /// Forces a reconnect.
    ///
    /// Returns true if this call armed the supervisor. Calling it while a
    /// reconnect is already running is a no-op.
    pub async fn trigger_reconnect(&self) -> bool {
        self.inner.supervisor.trigger().await
    }

    /// Pings the server and reconnects only if the ping fails.
    ///
    /// Returns true if this call armed the supervisor.
    pub async fn try_reconnecting(&self) -> bool {
        if self.is_healthy().await {
            return false;
        }
        self.inner.supervisor.trigger().await
    }

    /// Cancels all background work tied to this link.
    ///
    /// The supervisor stops and watchers return. An installed client stays
    /// open; call [`Link::disconnect`] to close it. A link that was
    /// reconnecting has no client left and ends up Disconnected.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.supervisor.stop().await;
        debug!("Link shut down");
    }

    /// Token cancelled by [`Link::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Returns a verified handle to `namespace`.
    ///
    /// The server is pinged first; on failure the supervisor is armed and
    /// [`LinkError::HealthCheck`] is returned. The unique index on the
    /// logical id field is created once per namespace and connection.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`], [`LinkError::Reconnecting`],
    /// [`LinkError::HealthCheck`] or [`LinkError::Index`].
    pub async fn collection(
        &self,
        namespace: &Namespace,
    ) -> Result<Arc<dyn CollectionHandle>, LinkError> {
        let state = &self.inner.state;
        let client = state.current_client().await?;

        if let Err(source) = state.ping(client.as_ref()).await {
            warn!(namespace = %namespace, error = %source, "Health check failed");
            self.inner.supervisor.trigger().await;
            return Err(LinkError::HealthCheck { source });
        }

        let collection = client.collection(namespace);
        self.ensure_index(namespace, collection.as_ref()).await?;
        Ok(collection)
    }

    async fn ensure_index(
        &self,
        namespace: &Namespace,
        collection: &dyn CollectionHandle,
    ) -> Result<(), LinkError> {
        if self.inner.state.read().await.indexed.contains(namespace) {
            return Ok(());
        }

        let field = self.inner.codec.id_field();
        match collection.create_unique_index(field).await {
            Ok(()) => debug!(namespace = %namespace, field, "Ensured unique index"),
            Err(e) if e.is_index_conflict() => {
                debug!(namespace = %namespace, field, "Unique index already exists");
            }
            Err(source) => {
                return Err(LinkError::Index {
                    namespace: namespace.to_string(),
                    field: field.to_string(),
                    source,
                })
            }
        }

        self.inner
            .state
            .write()
            .await
            .indexed
            .insert(namespace.clone());
        Ok(())
    }

    /// Acquires a handle and runs one store call against it.
    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        namespace: &Namespace,
        call: F,
    ) -> Result<T, LinkError>
    where
        F: FnOnce(Arc<dyn CollectionHandle>) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let _timer = Timer::new(operation, metrics::record_operation_duration);

        let result = match self.collection(namespace).await {
            Ok(collection) => call(collection)
                .await
                .map_err(|source| LinkError::Operation {
                    operation,
                    namespace: namespace.to_string(),
                    source,
                }),
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            metrics::increment_operation_errors(operation, e.category());
        }
        result
    }

    /// Inserts one record.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Decode`] if the record has no integral logical
    /// id, an acquisition error, or [`LinkError::Operation`].
    pub async fn add<T: Serialize>(
        &self,
        namespace: &Namespace,
        record: &T,
    ) -> Result<(), LinkError> {
        let document = self.inner.codec.encode(record)?;
        self.run("add", namespace, |c| async move { c.insert_one(document).await })
            .await
    }

    /// Inserts several records in one call.
    ///
    /// # Errors
    ///
    /// Same as [`Link::add`]. No record is written if any fails to encode.
    pub async fn add_many<T: Serialize>(
        &self,
        namespace: &Namespace,
        records: &[T],
    ) -> Result<(), LinkError> {
        let documents = records
            .iter()
            .map(|record| self.inner.codec.encode(record))
            .collect::<Result<Vec<_>, _>>()?;
        self.run("add_many", namespace, |c| async move {
            c.insert_many(documents).await
        })
        .await
    }

    /// Replaces the record whose logical id is `id`, returning the number of
    /// matched records (0 or 1).
    ///
    /// # Errors
    ///
    /// Same as [`Link::add`].
    pub async fn replace_by_id<T: Serialize>(
        &self,
        namespace: &Namespace,
        id: LogicalId,
        record: &T,
    ) -> Result<u64, LinkError> {
        let replacement = self.inner.codec.encode(record)?;
        let filter = self.inner.codec.id_filter(id);
        self.run("replace_by_id", namespace, |c| async move {
            c.replace_one(filter, replacement).await
        })
        .await
    }

    /// Deletes every record matching `filter`, returning the deleted count.
    ///
    /// # Errors
    ///
    /// Returns an acquisition error or [`LinkError::Operation`].
    pub async fn remove_by_filter(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<u64, LinkError> {
        self.run("remove_by_filter", namespace, |c| async move {
            c.delete_many(filter).await
        })
        .await
    }

    /// Deletes the record whose logical id is `id`, returning the deleted
    /// count.
    ///
    /// # Errors
    ///
    /// Returns an acquisition error or [`LinkError::Operation`].
    pub async fn remove_by_id(
        &self,
        namespace: &Namespace,
        id: LogicalId,
    ) -> Result<u64, LinkError> {
        let filter = self.inner.codec.id_filter(id);
        self.run("remove_by_id", namespace, |c| async move {
            c.delete_many(filter).await
        })
        .await
    }

    /// Returns every record in the collection.
    ///
    /// # Errors
    ///
    /// Returns an acquisition error, [`LinkError::Operation`], or
    /// [`LinkError::Decode`] if any document does not decode.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        namespace: &Namespace,
    ) -> Result<Vec<T>, LinkError> {
        self.get_filtered(namespace, Document::new()).await
    }

    /// Returns every record matching `filter`.
    ///
    /// # Errors
    ///
    /// Same as [`Link::get_all`].
    pub async fn get_filtered<T: DeserializeOwned>(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<Vec<T>, LinkError> {
        let documents = self
            .run("get_filtered", namespace, |c| async move { c.find(filter).await })
            .await?;
        Ok(self.inner.codec.decode_many(documents)?)
    }

    /// Returns the last record in natural order, or `None` for an empty
    /// collection.
    ///
    /// # Errors
    ///
    /// Same as [`Link::get_all`].
    pub async fn get_most_recently_inserted<T: DeserializeOwned>(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<T>, LinkError> {
        let document = self
            .run("get_most_recently_inserted", namespace, |c| async move {
                c.find_last().await
            })
            .await?;
        document
            .map(|document| self.inner.codec.decode(document))
            .transpose()
            .map_err(LinkError::from)
    }

    /// Calls `on_id` with the logical id of every record inserted into
    /// `namespace`.
    ///
    /// Runs until [`Link::shutdown`]; feed failures are retried.
    pub async fn watch_inserts<F>(&self, namespace: &Namespace, mut on_id: F)
    where
        F: FnMut(LogicalId) + Send,
    {
        self.watcher(namespace)
            .run(move |notice| on_id(notice.id))
            .await;
    }

    /// Creates an insert-only watcher on `namespace`.
    pub fn watcher(&self, namespace: &Namespace) -> ChangeWatcher {
        ChangeWatcher::new(self.clone(), namespace.clone())
    }

    /// Creates a watcher on `namespace` with custom settings.
    pub fn watcher_with_config(
        &self,
        namespace: &Namespace,
        config: WatchConfig,
    ) -> ChangeWatcher {
        ChangeWatcher::with_config(self.clone(), namespace.clone(), config)
    }
}
