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

//! Typed record codec.
//!
//! Bridges untyped BSON documents and caller-defined record types. The mapping
//! is structural: a record is encoded with `serde` into a [`Document`] and
//! decoded back the same way, so field names follow the record's serde
//! attributes.
//!
//! Every record stored through a link carries a numeric *logical id* field
//! (by default `"id"`) that is distinct from MongoDB's `_id`. The codec
//! verifies that field on both paths, so a document without a usable id is
//! reported as corrupted instead of decoding into a zero-valued record.
//!
//! # Example
//!
//! ```rust
//! use mongolink_core::codec::DocumentCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Order {
//!     id: i64,
//!     customer_id: i64,
//! }
//!
//! let codec = DocumentCodec::default();
//! let order = Order { id: 7, customer_id: 1234 };
//!
//! let document = codec.encode(&order).unwrap();
//! assert_eq!(codec.logical_id(&document).unwrap(), 7);
//!
//! let decoded: Order = codec.decode(document).unwrap();
//! assert_eq!(decoded, order);
//! ```

use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Caller-defined unique key of a stored record.
pub type LogicalId = i64;

/// Default name of the logical id field.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Errors raised while converting between records and documents.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record could not be serialized to BSON.
    #[error("failed to encode record: {0}")]
    Encode(#[from] bson::ser::Error),

    /// The document did not match the requested record type.
    #[error("failed to decode document: {0}")]
    Decode(#[from] bson::de::Error),

    /// The logical id field is absent.
    #[error("database contains corrupted document: missing `{field}` field")]
    MissingId {
        /// Name of the expected id field
        field: String,
    },

    /// The logical id field holds a non-integer value.
    #[error("database contains corrupted document: `{field}` is {found}, expected an integer")]
    MistypedId {
        /// Name of the id field
        field: String,
        /// BSON type that was found instead
        found: String,
    },

    /// A change event carried no document image to read the id from.
    #[error("database contains corrupted document: {operation} event has no document image")]
    MissingImage {
        /// Operation type of the event
        operation: String,
    },
}

impl CodecError {
    /// Returns true if the error concerns the logical id contract rather
    /// than the record shape.
    #[must_use]
    pub fn is_corrupted_id(&self) -> bool {
        matches!(
            self,
            Self::MissingId { .. } | Self::MistypedId { .. } | Self::MissingImage { .. }
        )
    }
}

/// Converts records to documents and back, enforcing the logical id field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentCodec {
    id_field: String,
}

impl Default for DocumentCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD)
    }
}

impl DocumentCodec {
    /// Creates a codec for records whose logical id lives in `id_field`.
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    /// Name of the logical id field.
    #[must_use]
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Builds the `{ <id_field>: id }` filter used for id-addressed writes.
    #[must_use]
    pub fn id_filter(&self, id: LogicalId) -> Document {
        let mut filter = Document::new();
        filter.insert(self.id_field.clone(), id);
        filter
    }

    /// Encodes a record into its storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the record does not serialize to a
    /// document, or an id error if the encoded form lacks an integral
    /// logical id.
    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Document, CodecError> {
        let document = bson::to_document(record)?;
        self.logical_id(&document)?;
        Ok(document)
    }

    /// Decodes a stored document into a record.
    ///
    /// Extra fields in the document are ignored.
    ///
    /// # Errors
    ///
    /// Returns an id error if the logical id is missing or mistyped, and
    /// [`CodecError::Decode`] if any other required field is absent or has
    /// the wrong type.
    pub fn decode<T: DeserializeOwned>(&self, document: Document) -> Result<T, CodecError> {
        self.logical_id(&document)?;
        Ok(bson::from_document(document)?)
    }

    /// Decodes a batch of documents, failing on the first bad element.
    ///
    /// # Errors
    ///
    /// Returns the first element's error; partial results are discarded.
    pub fn decode_many<T: DeserializeOwned>(
        &self,
        documents: Vec<Document>,
    ) -> Result<Vec<T>, CodecError> {
        documents
            .into_iter()
            .map(|document| self.decode(document))
            .collect()
    }

    /// Reads the logical id out of a document.
    ///
    /// Int32 and Int64 values are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingId`] or [`CodecError::MistypedId`].
    pub fn logical_id(&self, document: &Document) -> Result<LogicalId, CodecError> {
        match document.get(&self.id_field) {
            Some(Bson::Int64(id)) => Ok(*id),
            Some(Bson::Int32(id)) => Ok(LogicalId::from(*id)),
            Some(other) => Err(CodecError::MistypedId {
                field: self.id_field.clone(),
                found: format!("{:?}", other.element_type()),
            }),
            None => Err(CodecError::MissingId {
                field: self.id_field.clone(),
            }),
        }
    }
}
