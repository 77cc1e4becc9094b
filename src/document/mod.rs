//! Document model: ids, values, field mutations, selection expressions.

pub mod fields;
pub mod id;
pub mod selection;
pub mod update;

pub use fields::{Document, StoredDocument};
pub use id::{BucketId, BucketSpace, DocumentId, BUCKET_BITS};
pub use selection::{Selection, SelectionError};
pub use update::{FieldMutation, UpdateEngine, UpdateEngineError};
