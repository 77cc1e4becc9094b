//! Document values.
//!
//! A document is a typed, ordered field map. Field values are JSON values;
//! nested structs are nested objects. The put fan-out serializes a document
//! once into a [`Bytes`] payload that is shared across all replica sends.

use crate::core::error::{DistributorError, DistributorResult};
use crate::core::timestamp::Timestamp;
use crate::document::id::DocumentId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A document: id, type and field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The document id.
    pub id: DocumentId,

    /// The document type name.
    pub doc_type: String,

    /// Field values in field-name order.
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create a blank document of the given type.
    ///
    /// Used by create-if-missing: all fields start absent.
    pub fn blank(id: DocumentId, doc_type: impl Into<String>) -> Self {
        Self {
            id,
            doc_type: doc_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Look up a field value by dotted path.
    pub fn field_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a top-level field.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Remove a top-level field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Serialize into the put payload format.
    pub fn to_payload(&self) -> DistributorResult<Bytes> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| DistributorError::serialization(format!("encode document: {}", e)))?;
        Ok(Bytes::from(raw))
    }

    /// Deserialize from a put payload.
    pub fn from_payload(payload: &Bytes) -> DistributorResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| DistributorError::serialization(format!("decode document: {}", e)))
    }
}

/// A stored document version as returned by a full get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// The document value.
    pub document: Document,

    /// The persisted-timestamp of this version.
    pub persisted_timestamp: Timestamp,
}
