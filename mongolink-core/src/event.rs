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

//! MongoDB change feed event representation.
//!
//! The driver hands change feed notifications over as raw envelope
//! documents. [`ChangeEvent`] is the decoded form of one envelope: its
//! operation type, namespace and the document images it carries.
//!
//! # Examples
//!
//! ```rust
//! use mongolink_core::codec::DocumentCodec;
//! use mongolink_core::event::{ChangeEvent, OperationType};
//! use bson::doc;
//!
//! let raw = doc! {
//!     "_id": { "_data": "token123" },
//!     "operationType": "insert",
//!     "ns": { "db": "Headquarters", "coll": "Orders" },
//!     "documentKey": { "_id": 1 },
//!     "fullDocument": { "_id": 1, "id": 7_i64, "customer_id": 1234_i64 },
//! };
//!
//! let event = ChangeEvent::try_from(raw).unwrap();
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), "Orders");
//! assert_eq!(event.logical_id(&DocumentCodec::default()).unwrap(), 7);
//! ```

use crate::codec::{CodecError, DocumentCodec, LogicalId};
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error that can occur when decoding a raw change feed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// A mandatory envelope field is absent or has the wrong type
    MissingField(&'static str),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::MissingField(field) => {
                write!(f, "change event is missing `{}`", field)
            }
        }
    }
}

impl std::error::Error for ConversionError {}

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps forward compatibility with operation types
/// introduced by newer server versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated (modified in place)
    Update,

    /// A document was deleted from a collection
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The change stream was invalidated (collection dropped, renamed, etc.)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropDatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this library does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns the wire name of the operation, as used in `$match` filters.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(name) => name,
        }
    }

    /// Returns true if this operation modifies data (insert, update, replace).
    #[inline]
    pub fn is_data_modification(&self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        )
    }

    /// Returns true if events of this kind carry a document image the
    /// logical id can be read from.
    #[inline]
    pub fn carries_document(&self) -> bool {
        self.is_data_modification() || *self == OperationType::Delete
    }

    /// Returns true if this is an unknown operation type.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, OperationType::Unknown(_))
    }
}

impl From<&str> for OperationType {
    fn from(name: &str) -> Self {
        match name {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "replace" => Self::Replace,
            "invalidate" => Self::Invalidate,
            "drop" => Self::Drop,
            "dropDatabase" => Self::DropDatabase,
            "rename" => Self::Rename,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MongoDB namespace (database + collection).
///
/// Namespaces are resolved once at startup and passed to the link and its
/// watchers by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// One decoded change feed notification.
///
/// # Examples
///
/// ```rust
/// use mongolink_core::event::{ChangeEvent, OperationType};
///
/// fn describe(event: &ChangeEvent) -> String {
///     match event.operation {
///         OperationType::Insert => format!("new document in {}", event.collection_name()),
///         OperationType::Delete => format!("document removed from {}", event.collection_name()),
///         _ => format!("{} in {}", event.operation, event.collection_name()),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Type of operation that occurred
    pub operation: OperationType,

    /// Namespace where the operation occurred
    ///
    /// Empty for deployment-wide events that carry no namespace.
    pub namespace: Namespace,

    /// Document key (`_id` and shard key if sharded)
    pub document_key: Option<Document>,

    /// Document after the operation (post-image)
    ///
    /// Present for insert and replace, for update when update lookup is
    /// requested.
    pub full_document: Option<Document>,

    /// Document before the operation (pre-image)
    ///
    /// Present for delete when pre-images are enabled on the collection and
    /// requested by the feed.
    pub full_document_before_change: Option<Document>,

    /// Time of the operation in the oplog, at second precision
    pub cluster_time: Option<DateTime<Utc>>,

    /// Resume token for this event
    pub resume_token: Option<Document>,
}

impl ChangeEvent {
    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is a delete operation.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns true if this is an invalidate operation.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// Returns the database name.
    #[inline]
    pub fn database_name(&self) -> &str {
        &self.namespace.database
    }

    /// Returns the document image describing the affected record.
    ///
    /// Deletes are described by their pre-image, inserts, updates and
    /// replaces by their post-image. Other operations have none.
    pub fn affected_document(&self) -> Option<&Document> {
        match self.operation {
            OperationType::Delete => self.full_document_before_change.as_ref(),
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                self.full_document.as_ref()
            }
            _ => None,
        }
    }

    /// Extracts the logical id of the affected record.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingImage`] when the event has no suitable
    /// image, or the codec's id error when the id is missing or mistyped.
    pub fn logical_id(&self, codec: &DocumentCodec) -> Result<LogicalId, CodecError> {
        let image = self
            .affected_document()
            .ok_or_else(|| CodecError::MissingImage {
                operation: self.operation.to_string(),
            })?;
        codec.logical_id(image)
    }
}

fn take_document(envelope: &mut Document, key: &str) -> Option<Document> {
    match envelope.remove(key) {
        Some(Bson::Document(document)) => Some(document),
        _ => None,
    }
}

/// Decodes a raw envelope as delivered by the driver.
impl TryFrom<Document> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(mut envelope: Document) -> Result<Self, Self::Error> {
        let operation = envelope
            .get_str("operationType")
            .map(OperationType::from)
            .map_err(|_| ConversionError::MissingField("operationType"))?;

        let namespace = envelope
            .get_document("ns")
            .map(|ns| {
                Namespace::new(
                    ns.get_str("db").unwrap_or_default(),
                    ns.get_str("coll").unwrap_or_default(),
                )
            })
            .unwrap_or_else(|_| Namespace::new("", ""));

        let cluster_time = match envelope.get("clusterTime") {
            Some(Bson::Timestamp(ts)) => DateTime::from_timestamp(i64::from(ts.time), 0),
            _ => None,
        };

        Ok(Self {
            operation,
            namespace,
            document_key: take_document(&mut envelope, "documentKey"),
            full_document: take_document(&mut envelope, "fullDocument"),
            full_document_before_change: take_document(&mut envelope, "fullDocumentBeforeChange"),
            cluster_time,
            resume_token: take_document(&mut envelope, "_id"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Timestamp};

    fn envelope(operation: &str) -> Document {
        doc! {
            "_id": { "_data": "token" },
            "operationType": operation,
            "ns": { "db": "Headquarters", "coll": "Orders" },
            "documentKey": { "_id": 1 },
            "clusterTime": Timestamp { time: 1_700_000_000, increment: 3 },
        }
    }

    #[test]
    fn test_insert_uses_post_image() {
        let mut raw = envelope("insert");
        raw.insert("fullDocument", doc! { "id": 7_i64 });

        let event = ChangeEvent::try_from(raw).unwrap();
        assert!(event.is_insert());
        assert_eq!(event.namespace, Namespace::new("Headquarters", "Orders"));
        assert_eq!(event.resume_token, Some(doc! { "_data": "token" }));
        assert_eq!(
            event.cluster_time,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(event.logical_id(&DocumentCodec::default()).unwrap(), 7);
    }

    #[test]
    fn test_delete_uses_pre_image() {
        let mut raw = envelope("delete");
        raw.insert("fullDocument", doc! { "id": 1_i64 });
        raw.insert("fullDocumentBeforeChange", doc! { "id": 9_i64 });

        let event = ChangeEvent::try_from(raw).unwrap();
        assert!(event.is_delete());
        assert_eq!(event.logical_id(&DocumentCodec::default()).unwrap(), 9);
    }

    #[test]
    fn test_delete_without_pre_image_is_corrupted() {
        let event = ChangeEvent::try_from(envelope("delete")).unwrap();
        let err = event.logical_id(&DocumentCodec::default()).unwrap_err();
        assert!(matches!(err, CodecError::MissingImage { .. }));
    }

    #[test]
    fn test_update_and_replace_use_post_image() {
        for operation in ["update", "replace"] {
            let mut raw = envelope(operation);
            raw.insert("fullDocument", doc! { "id": 3_i32 });
            let event = ChangeEvent::try_from(raw).unwrap();
            assert_eq!(event.logical_id(&DocumentCodec::default()).unwrap(), 3);
        }
    }

    #[test]
    fn test_missing_operation_type() {
        let raw = doc! { "ns": { "db": "a", "coll": "b" } };
        let err = ChangeEvent::try_from(raw).unwrap_err();
        assert_eq!(err, ConversionError::MissingField("operationType"));
    }

    #[test]
    fn test_unknown_operation_type_is_preserved() {
        let event = ChangeEvent::try_from(envelope("shardCollection")).unwrap();
        assert!(event.operation.is_unknown());
        assert_eq!(event.operation.as_str(), "shardCollection");
        assert!(event.affected_document().is_none());
    }

    #[test]
    fn test_operation_type_names_round_trip() {
        for name in ["insert", "update", "delete", "replace", "dropDatabase"] {
            assert_eq!(OperationType::from(name).as_str(), name);
        }
        assert!(OperationType::Delete.carries_document());
        assert!(!OperationType::Drop.carries_document());
    }
}
