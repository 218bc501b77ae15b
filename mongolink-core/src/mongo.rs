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

//! [`Driver`] implementation backed by the official MongoDB driver.

use crate::driver::{ChangeFeed, CollectionHandle, Connection, Driver, DriverError, FeedFilter};
use crate::event::Namespace;
use async_trait::async_trait;
use bson::{doc, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::{
    error::{Error as MongoError, ErrorKind as MongoErrorKind, WriteFailure},
    options::{
        ChangeStreamOptions, ClientOptions, FindOneOptions, FullDocumentBeforeChangeType,
        FullDocumentType, IndexOptions,
    },
    Client, Collection, IndexModel,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

impl From<MongoError> for DriverError {
    fn from(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            MongoErrorKind::Write(WriteFailure::WriteError(write_err)) => Some(write_err.code),
            _ => None,
        };
        let labels: Vec<String> = err.labels().iter().cloned().collect();

        let mut driver_err = DriverError::new(err.to_string()).with_labels(labels);
        if let Some(code) = code {
            driver_err = driver_err.with_code(code);
        }
        driver_err.with_source(err)
    }
}

/// Dials MongoDB deployments through [`mongodb::Client`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDriver;

impl MongoDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MongoDriver {
    async fn dial(
        &self,
        uri: &str,
        server_selection_timeout: Duration,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(server_selection_timeout);

        let client = Client::with_options(options)?;
        debug!("Created MongoDB client");

        Ok(Arc::new(MongoConnection { client }))
    }
}

/// One [`mongodb::Client`].
#[derive(Debug)]
pub struct MongoConnection {
    client: Client,
}

#[async_trait]
impl Connection for MongoConnection {
    async fn ping(&self) -> Result<(), DriverError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    fn collection(&self, namespace: &Namespace) -> Arc<dyn CollectionHandle> {
        let collection = self
            .client
            .database(&namespace.database)
            .collection::<Document>(&namespace.collection);

        Arc::new(MongoCollection {
            namespace: namespace.clone(),
            collection,
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        // Client handles are shared, so only this clone is consumed.
        self.client.clone().shutdown().immediate(true).await;
        Ok(())
    }
}

/// Collection handle over [`mongodb::Collection`].
#[derive(Debug)]
pub struct MongoCollection {
    namespace: Namespace,
    collection: Collection<Document>,
}

fn to_mongo_options(filter: &FeedFilter) -> ChangeStreamOptions {
    let mut options = ChangeStreamOptions::default();

    if filter.full_document_on_update {
        options.full_document = Some(FullDocumentType::UpdateLookup);
    }

    if filter.full_document_before_change {
        options.full_document_before_change = Some(FullDocumentBeforeChangeType::WhenAvailable);
    }

    options.batch_size = filter.batch_size;
    options
}

#[async_trait]
impl CollectionHandle for MongoCollection {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn create_unique_index(&self, field: &str) -> Result<(), DriverError> {
        let mut keys = Document::new();
        keys.insert(field, 1);

        let index = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();

        self.collection.create_index(index).await?;
        Ok(())
    }

    async fn insert_one(&self, document: Document) -> Result<(), DriverError> {
        self.collection.insert_one(document).await?;
        Ok(())
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<(), DriverError> {
        if documents.is_empty() {
            return Ok(());
        }
        self.collection.insert_many(documents).await?;
        Ok(())
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
    ) -> Result<u64, DriverError> {
        let result = self.collection.replace_one(filter, replacement).await?;
        Ok(result.matched_count)
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, DriverError> {
        let result = self.collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn find(&self, filter: Document) -> Result<Vec<Document>, DriverError> {
        let cursor = self.collection.find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_last(&self) -> Result<Option<Document>, DriverError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "$natural": -1 })
            .build();
        Ok(self.collection.find_one(doc! {}).with_options(options).await?)
    }

    async fn watch(&self, filter: &FeedFilter) -> Result<ChangeFeed, DriverError> {
        let stream = self
            .collection
            .watch()
            .pipeline(filter.pipeline())
            .with_options(to_mongo_options(filter))
            .await?
            .with_type::<Document>();

        Ok(stream.map_err(DriverError::from).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationType;

    #[test]
    fn test_mongo_options_follow_filter() {
        let mut filter = FeedFilter::for_operations(vec![OperationType::Insert, OperationType::Delete]);
        filter.batch_size = Some(50);

        let options = to_mongo_options(&filter);
        assert!(options.full_document.is_none());
        assert!(matches!(
            options.full_document_before_change,
            Some(FullDocumentBeforeChangeType::WhenAvailable)
        ));
        assert_eq!(options.batch_size, Some(50));
    }

    #[tokio::test]
    async fn test_dial_rejects_malformed_uri() {
        let err = MongoDriver::new()
            .dial("not-a-mongodb-uri", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
