//! Client-facing update command and reply.

use crate::core::timestamp::Timestamp;
use crate::core::trace::Trace;
use crate::document::id::{BucketSpace, DocumentId};
use crate::document::update::FieldMutation;
use serde::{Deserialize, Serialize};

/// A test-and-set condition guarding an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAndSetCondition {
    /// Selection expression over the stored document.
    pub selection: String,

    /// When set and equal to the stored persisted-timestamp, the selection
    /// is treated as satisfied without evaluating the expression.
    pub required_timestamp: Option<Timestamp>,
}

impl TestAndSetCondition {
    /// Condition with a selection expression only.
    pub fn selection_only(selection: impl Into<String>) -> Self {
        Self {
            selection: selection.into(),
            required_timestamp: None,
        }
    }
}

/// A client-issued update command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCommand {
    /// Target document.
    pub doc_id: DocumentId,

    /// Bucket space holding the document.
    pub space: BucketSpace,

    /// Document type the update applies to.
    pub doc_type: String,

    /// Ordered field mutations.
    pub mutations: Vec<FieldMutation>,

    /// Optional test-and-set condition.
    pub condition: Option<TestAndSetCondition>,

    /// Create a blank document when none is stored.
    pub create_if_missing: bool,

    /// Explicit update-timestamp; when unset the coordinator allocates one.
    pub update_timestamp: Option<Timestamp>,

    /// Client-supplied trace to extend.
    #[serde(default)]
    pub trace: Trace,
}

impl UpdateCommand {
    /// Minimal command for the given document.
    pub fn new(doc_id: DocumentId, space: BucketSpace, doc_type: impl Into<String>) -> Self {
        Self {
            doc_id,
            space,
            doc_type: doc_type.into(),
            mutations: Vec::new(),
            condition: None,
            create_if_missing: false,
            update_timestamp: None,
            trace: Trace::new(),
        }
    }

    /// Append a mutation.
    pub fn with_mutation(mut self, mutation: FieldMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Attach a condition.
    pub fn with_condition(mut self, condition: TestAndSetCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Enable create-if-missing.
    pub fn with_create_if_missing(mut self) -> Self {
        self.create_if_missing = true;
        self
    }

    /// Set an explicit update-timestamp.
    pub fn with_update_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.update_timestamp = Some(timestamp);
        self
    }

    /// Whether the command carries a test-and-set condition.
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }
}

/// Final status of an update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// Update applied on all replicas, or document absent without
    /// create-if-missing.
    Ok,
    /// Document absent; distinguished alias of Ok-without-document.
    NotFound,
    /// The condition evaluated false against the authoritative document.
    TestAndSetFailed,
    /// Explicit update-timestamp did not supersede the persisted version.
    TimestampConflict,
    /// Bucket ownership moved mid-flight; retry.
    TransientOwnershipChanged,
    /// Another operation for the same document is in flight; retry.
    Busy,
    /// Feed admission refused the operation.
    FeedBlocked,
    /// Operation aborted by the distributor.
    Cancelled,
    /// Distributor shutting down.
    Aborted,
    /// Aggregated irrecoverable sub-operation failure.
    InternalError,
}

impl UpdateStatus {
    /// Whether the operation completed without error.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::NotFound)
    }

    /// Whether the client should retry the operation unchanged.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::TransientOwnershipChanged
                | Self::Busy
                | Self::FeedBlocked
                | Self::Cancelled
                | Self::Aborted
        )
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::TestAndSetFailed => "test_and_set_failed",
            Self::TimestampConflict => "timestamp_conflict",
            Self::TransientOwnershipChanged => "transient_ownership_changed",
            Self::Busy => "busy",
            Self::FeedBlocked => "feed_blocked",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
            Self::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// The single reply emitted for an update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReply {
    /// Final status.
    pub status: UpdateStatus,

    /// Old persisted-timestamp of the document, when known.
    pub old_timestamp: Option<Timestamp>,

    /// Error or informational message.
    pub message: Option<String>,

    /// Accumulated operation trace.
    pub trace: Trace,
}

impl UpdateReply {
    /// Whether a document was found by the operation.
    pub fn found_document(&self) -> bool {
        self.old_timestamp.is_some_and(|t| t.is_set())
    }
}
