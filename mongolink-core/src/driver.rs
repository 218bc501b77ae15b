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

//! Backing-store driver capability.
//!
//! The link never talks to MongoDB directly. It goes through three traits:
//!
//! - [`Driver`] opens connections.
//! - [`Connection`] is one live client: it can be pinged, closed, and asked
//!   for collection handles.
//! - [`CollectionHandle`] performs the store operations the link needs,
//!   including subscribing to a change feed.
//!
//! [`MongoDriver`](crate::mongo::MongoDriver) implements them on top of the
//! official driver and [`MemoryDriver`](crate::memory::MemoryDriver) keeps
//! everything in process.
//!
//! # Implementing a Driver
//!
//! ```rust
//! use async_trait::async_trait;
//! use mongolink_core::driver::{Connection, Driver, DriverError};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct Unreachable;
//!
//! #[async_trait]
//! impl Driver for Unreachable {
//!     async fn dial(
//!         &self,
//!         uri: &str,
//!         _server_selection_timeout: Duration,
//!     ) -> Result<Arc<dyn Connection>, DriverError> {
//!         Err(DriverError::new(format!("{uri} is unreachable")).with_code(6))
//!     }
//! }
//! ```

use crate::event::{Namespace, OperationType};
use async_trait::async_trait;
use bson::{doc, Document};
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Stream of raw change feed envelopes.
///
/// Each item is either one envelope document or the error that broke the
/// feed. Consumers drop the feed after the first error.
pub type ChangeFeed = BoxStream<'static, Result<Document, DriverError>>;

/// Server error codes that mean an index with the same name or keys exists.
const INDEX_CONFLICT_CODES: [i32; 3] = [
    68, // IndexAlreadyExists
    85, // IndexOptionsConflict
    86, // IndexKeySpecsConflict
];

/// Server error code for a unique index violation.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Error reported by a driver operation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    code: Option<i32>,
    labels: Vec<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    /// Creates an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            labels: Vec::new(),
            source: None,
        }
    }

    /// Attaches a server error code.
    #[must_use]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches server error labels (e.g. "NetworkError").
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Attaches the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Server error code, if the server returned one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Server error labels.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Returns true if the failure is expected to clear up on its own.
    ///
    /// Uses error labels first (RetryableWriteError, TransientTransactionError,
    /// NetworkError), then transient server codes seen during network trouble
    /// and replica set elections.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        if self.labels.iter().any(|l| {
            l == "RetryableWriteError" || l == "TransientTransactionError" || l == "NetworkError"
        }) {
            return true;
        }

        matches!(
            self.code,
            Some(
                6 |    // HostUnreachable
                7 |    // HostNotFound
                89 |   // NetworkTimeout
                91 |   // ShutdownInProgress
                10107 | // NotWritablePrimary
                11600 | // InterruptedAtShutdown
                11602 | // InterruptedDueToReplStateChange
                13435 | // NotPrimaryNoSecondaryOk
                13436 | // NotPrimaryOrSecondary
                43 // CursorNotFound
            )
        )
    }

    /// Returns true if index creation failed because the index already
    /// exists.
    #[must_use]
    pub fn is_index_conflict(&self) -> bool {
        self.code.is_some_and(|c| INDEX_CONFLICT_CODES.contains(&c))
    }

    /// Returns true if a write violated a unique index.
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        self.code == Some(DUPLICATE_KEY_CODE)
    }
}

/// Which change feed events to subscribe to and which images to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    /// Operation types to deliver
    pub operations: Vec<OperationType>,

    /// Whether update events should carry the full post-image
    pub full_document_on_update: bool,

    /// Whether events should carry the pre-image (needed for deletes)
    pub full_document_before_change: bool,

    /// Batch size for fetching events
    pub batch_size: Option<u32>,
}

impl FeedFilter {
    /// Builds a filter for the given operation types, requesting the
    /// document images those types need.
    #[must_use]
    pub fn for_operations(operations: Vec<OperationType>) -> Self {
        let full_document_on_update = operations.contains(&OperationType::Update);
        let full_document_before_change = operations.contains(&OperationType::Delete);
        Self {
            operations,
            full_document_on_update,
            full_document_before_change,
            batch_size: None,
        }
    }

    /// Returns true if events of `operation` should be delivered.
    #[must_use]
    pub fn accepts(&self, operation: &OperationType) -> bool {
        self.operations.contains(operation)
    }

    /// Aggregation pipeline restricting the feed to the configured types.
    #[must_use]
    pub fn pipeline(&self) -> Vec<Document> {
        let names: Vec<&str> = self.operations.iter().map(OperationType::as_str).collect();
        vec![doc! { "$match": { "operationType": { "$in": names } } }]
    }
}

/// Opens connections to the backing store.
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    /// Opens a connection to `uri`.
    ///
    /// Server selection must give up after `server_selection_timeout` so an
    /// unreachable deployment fails fast instead of hanging.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is malformed or the client cannot be
    /// created.
    async fn dial(
        &self,
        uri: &str,
        server_selection_timeout: Duration,
    ) -> Result<Arc<dyn Connection>, DriverError>;
}

/// A live client connection.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Issues a lightweight liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the server did not answer.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Returns a handle to a collection.
    fn collection(&self, namespace: &Namespace) -> Arc<dyn CollectionHandle>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client could not be shut down cleanly. A
    /// dead connection may fail to close; callers tearing down a broken
    /// link ignore the error.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Store operations on one collection.
#[async_trait]
pub trait CollectionHandle: Send + Sync + fmt::Debug {
    /// Namespace of this collection.
    fn namespace(&self) -> &Namespace;

    /// Creates a unique ascending index on `field`.
    async fn create_unique_index(&self, field: &str) -> Result<(), DriverError>;

    /// Inserts one document.
    async fn insert_one(&self, document: Document) -> Result<(), DriverError>;

    /// Inserts several documents in one call.
    async fn insert_many(&self, documents: Vec<Document>) -> Result<(), DriverError>;

    /// Replaces the first document matching `filter`, returning the matched
    /// count.
    async fn replace_one(&self, filter: Document, replacement: Document)
        -> Result<u64, DriverError>;

    /// Deletes every document matching `filter`, returning the deleted
    /// count.
    async fn delete_many(&self, filter: Document) -> Result<u64, DriverError>;

    /// Returns every document matching `filter`.
    async fn find(&self, filter: Document) -> Result<Vec<Document>, DriverError>;

    /// Returns the last document in natural (insertion) order.
    async fn find_last(&self) -> Result<Option<Document>, DriverError>;

    /// Subscribes to the collection's change feed.
    async fn watch(&self, filter: &FeedFilter) -> Result<ChangeFeed, DriverError>;
}
