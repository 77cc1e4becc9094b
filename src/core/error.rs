//! Error types for the distributor core.
//!
//! [`DistributorError`] covers every failure the update coordinator folds
//! into a client reply. Errors never escape an operation any other way:
//! [`DistributorError::reply_status`] classifies each variant into the
//! reply status taxonomy, and transient variants tell the client to retry.

use crate::api::update::UpdateStatus;
use thiserror::Error;

/// Failure conditions inside the distributor tier.
#[derive(Debug, Error)]
pub enum DistributorError {
    /// The command referenced an empty or malformed document id.
    #[error("invalid document id: {message}")]
    InvalidDocumentId { message: String },

    /// The command named a bucket space this distributor does not serve.
    #[error("unsupported bucket space: {space}")]
    UnsupportedBucketSpace { space: String },

    /// The command payload could not be decoded or re-encoded.
    #[error("serialization failure: {message}")]
    Serialization { message: String },

    /// The test-and-set selection expression failed to parse.
    #[error("invalid selection: {message}")]
    InvalidSelection { message: String },

    /// Bucket ownership moved to another distributor mid-flight.
    #[error("bucket ownership changed for {bucket}")]
    OwnershipChanged { bucket: String },

    /// The per-document sequencer refused the operation.
    #[error("document {doc_id} is already being operated on")]
    SequencingConflict { doc_id: String },

    /// Feed admission is closed.
    #[error("feed blocked: {reason}")]
    FeedBlocked { reason: String },

    /// An explicit update-timestamp did not order after the persisted version.
    #[error("timestamp conflict: update {update} does not supersede persisted {persisted}")]
    TimestampConflict { update: u64, persisted: u64 },

    /// Aggregated irrecoverable sub-operation failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DistributorError {
    /// Create a Serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an InvalidSelection error.
    pub fn invalid_selection(message: impl Into<String>) -> Self {
        Self::InvalidSelection {
            message: message.into(),
        }
    }

    /// The reply status this error folds into.
    pub fn reply_status(&self) -> UpdateStatus {
        match self {
            Self::OwnershipChanged { .. } => UpdateStatus::TransientOwnershipChanged,
            Self::SequencingConflict { .. } => UpdateStatus::Busy,
            Self::FeedBlocked { .. } => UpdateStatus::FeedBlocked,
            Self::TimestampConflict { .. } => UpdateStatus::TimestampConflict,
            Self::InvalidDocumentId { .. }
            | Self::UnsupportedBucketSpace { .. }
            | Self::Serialization { .. }
            | Self::InvalidSelection { .. }
            | Self::Internal { .. } => UpdateStatus::InternalError,
        }
    }

    /// Whether the client should retry the operation unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::OwnershipChanged { .. }
                | Self::SequencingConflict { .. }
                | Self::FeedBlocked { .. }
        )
    }
}

/// Result type using DistributorError.
pub type DistributorResult<T> = Result<T, DistributorError>;
