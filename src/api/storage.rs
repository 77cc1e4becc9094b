//! Storage sub-command protocol.
//!
//! The coordinator talks to storage nodes with five sub-command kinds:
//! direct updates, metadata gets, full gets, condition probes, and puts.
//! Each carries a stripe-unique message id that the reply echoes back; the
//! coordinator matches replies to pending sends by that id alone.

use crate::core::timestamp::Timestamp;
use crate::core::trace::Trace;
use crate::document::fields::StoredDocument;
use crate::document::id::{BucketId, BucketSpace, DocumentId};
use crate::document::update::FieldMutation;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stripe-unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Allocates message ids for one stripe.
#[derive(Debug, Default)]
pub struct MessageIdAllocator {
    next: u64,
}

impl MessageIdAllocator {
    /// Create an allocator starting at 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next id.
    pub fn allocate(&mut self) -> MessageId {
        let id = MessageId(self.next);
        self.next += 1;
        id
    }
}

/// Body of a storage sub-command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageCommandBody {
    /// Apply the update directly on the node (fast path). The node evaluates
    /// any condition itself.
    Update {
        doc_id: DocumentId,
        mutations: Vec<FieldMutation>,
        selection: Option<String>,
        required_timestamp: Option<Timestamp>,
        create_if_missing: bool,
        update_timestamp: Option<Timestamp>,
    },

    /// Cheap metadata-only get: persisted-timestamp and replica checksum.
    MetadataGet { doc_id: DocumentId },

    /// Full document get.
    FullGet { doc_id: DocumentId },

    /// Ask the node whether a selection holds on its stored document.
    ConditionProbe {
        doc_id: DocumentId,
        selection: String,
    },

    /// Write a new document version. The payload is the serialized document,
    /// shared across the replica fan-out.
    Put {
        doc_id: DocumentId,
        payload: Bytes,
        new_timestamp: Timestamp,
    },
}

impl StorageCommandBody {
    /// Sub-command kind name for traces and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::MetadataGet { .. } => "metadata_get",
            Self::FullGet { .. } => "full_get",
            Self::ConditionProbe { .. } => "condition_probe",
            Self::Put { .. } => "put",
        }
    }
}

/// A storage sub-command addressed to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCommand {
    /// Stripe-unique id echoed by the reply.
    pub id: MessageId,

    /// Target storage node.
    pub node: u16,

    /// Target bucket.
    pub bucket: BucketId,

    /// Bucket space.
    pub space: BucketSpace,

    /// Command body.
    pub body: StorageCommandBody,
}

/// Per-node outcome of a storage sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    /// The node applied the sub-command.
    Ok,
    /// The node no longer considers itself responsible for the bucket.
    WrongDistribution,
    /// The node does not have the bucket at all.
    BucketNotFound,
    /// The node's local condition evaluation failed (fast path only).
    TestAndSetFailed,
    /// The sub-command deadline expired.
    Timeout,
    /// Any other node-side failure.
    InternalFailure,
}

impl ReplyOutcome {
    /// Whether the sub-command succeeded on the node.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Whether the outcome signals a bucket ownership change.
    pub fn is_ownership_change(self) -> bool {
        matches!(self, Self::WrongDistribution | Self::BucketNotFound)
    }
}

/// Body of a storage sub-command reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageReplyBody {
    /// Reply to a direct update. `old_timestamp` is zero when the node had
    /// no stored version.
    Update { old_timestamp: Timestamp },

    /// Reply to a metadata get.
    MetadataGet {
        persisted_timestamp: Timestamp,
        checksum: u32,
    },

    /// Reply to a full get. `None` when the node has no stored version.
    FullGet { document: Option<StoredDocument> },

    /// Reply to a condition probe.
    ConditionProbe { matched: bool, document_found: bool },

    /// Reply to a put.
    Put,
}

/// A storage sub-command reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReply {
    /// Echoed message id.
    pub id: MessageId,

    /// Replying node.
    pub node: u16,

    /// Per-node outcome.
    pub outcome: ReplyOutcome,

    /// Error detail when the outcome is a failure.
    pub message: Option<String>,

    /// Node-side trace fragment, absorbed into the operation trace.
    #[serde(default)]
    pub trace: Trace,

    /// Reply body. Failure replies still carry a body of the matching kind.
    pub body: StorageReplyBody,
}

impl StorageReply {
    /// Successful reply with the given body.
    pub fn ok(id: MessageId, node: u16, body: StorageReplyBody) -> Self {
        Self {
            id,
            node,
            outcome: ReplyOutcome::Ok,
            message: None,
            trace: Trace::new(),
            body,
        }
    }

    /// Failure reply.
    pub fn failure(
        id: MessageId,
        node: u16,
        outcome: ReplyOutcome,
        message: impl Into<String>,
        body: StorageReplyBody,
    ) -> Self {
        Self {
            id,
            node,
            outcome,
            message: Some(message.into()),
            trace: Trace::new(),
            body,
        }
    }
}
