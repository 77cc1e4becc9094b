//! Document identifiers and bucket derivation.
//!
//! Documents are routed to buckets by hashing the id with xxHash64 and
//! keeping the low bucket bits:
//! `bucket = hash64(id_bytes) & ((1 << BUCKET_BITS) - 1)`
//!
//! Every replica placement and ownership decision keys off the resulting
//! [`BucketId`], so the derivation must stay stable across releases.

use crate::core::error::{DistributorError, DistributorResult};
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Number of low hash bits that form the bucket id.
pub const BUCKET_BITS: u32 = 16;

/// Hash seed for sequencing hashes, distinct from the routing seed.
const SEQUENCING_SEED: u64 = 0x5eb7_01d5;

/// A document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Parse a document id, rejecting empty input.
    pub fn parse(raw: impl Into<String>) -> DistributorResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DistributorError::InvalidDocumentId {
                message: "empty id".to_string(),
            });
        }
        if raw.bytes().any(|b| b.is_ascii_control()) {
            return Err(DistributorError::InvalidDocumentId {
                message: format!("control characters in id {:?}", raw),
            });
        }
        Ok(Self(raw))
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the bucket containing this document.
    pub fn bucket(&self) -> BucketId {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.0.as_bytes());
        BucketId::from_hash(hasher.finish())
    }

    /// Stable 64-bit hash of the id, used for sequencing.
    pub fn sequencing_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(SEQUENCING_SEED);
        hasher.write(self.0.as_bytes());
        hasher.finish()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bucket identifier: the routing partition holding many documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(u64);

impl BucketId {
    /// Build a bucket id from a full 64-bit hash.
    pub fn from_hash(hash: u64) -> Self {
        Self(hash & ((1 << BUCKET_BITS) - 1))
    }

    /// Build a bucket id from an already-masked raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw bucket value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// The bucket space a document lives in.
///
/// `Default` holds regular documents; `Global` holds documents replicated to
/// every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSpace {
    Default,
    Global,
}

impl BucketSpace {
    /// The canonical space name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Global => "global",
        }
    }

    /// Parse a space name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

impl std::fmt::Display for BucketSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
