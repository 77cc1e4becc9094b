//! Stratum - distributor tier of a replicated document store.
//!
//! Stratum coordinates client updates across a document's replica set. Each
//! update runs as a two-phase operation on a distributor stripe: an
//! optimistic direct-update fast path when every replica is already in sync,
//! and a defensive read-modify-write slow path otherwise.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Clients                              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ update commands
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Distributor Stripe                        │
//! │   sequencing │ feed admission │ operation routing │ metrics     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Update Coordinator                          │
//! │  fast path: direct updates   │   slow path: get → apply → put   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ sub-commands
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Storage Nodes                            │
//! │        bucket replicas │ persisted document versions            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types
//! - [`core::timestamp`] - Persisted-timestamps and monotone allocation
//! - [`core::trace`] - Operation trace accumulation
//!
//! ## Document Model
//! - [`document::id`] - Document ids, bucket derivation, bucket spaces
//! - [`document::fields`] - Document values and payload codec
//! - [`document::update`] - Field mutations and the update engine
//! - [`document::selection`] - Test-and-set selection expressions
//!
//! ## Bucket Layer
//! - [`bucket::replica`] - Replica metadata and snapshots
//! - [`bucket::consistency`] - Fast-path eligibility
//! - [`bucket::db`] - The bucket database
//! - [`bucket::ownership`] - Cluster-state view and ownership mapping
//!
//! ## Operation
//! - [`operation::coordinator`] - The two-phase update state machine
//! - [`operation::tracker`] - Persistence message tracking
//! - [`operation::newest_replica`] - Newest-replica selection
//! - [`operation::sequencing`] - Per-document sequencing
//! - [`operation::reply`] - Reply composition
//!
//! ## Runtime
//! - [`stripe`] - The single-threaded stripe event loop
//! - [`ops::observability`] - Metrics
//!
//! # Key Invariants
//!
//! - Exactly one reply is emitted per operation, across every schedule
//! - No sub-command is dispatched after the reply is emitted
//! - Operations for the same document id are strictly serialized
//! - The put-phase timestamp orders strictly after every observed persisted
//!   version
//! - The fast-path restart from consistent metadata never changes the
//!   operation's recorded mode

// Core infrastructure
pub mod core;

// Document model
pub mod document;

// Bucket layer
pub mod bucket;

// Message surfaces
pub mod api;

// Update operation machinery
pub mod operation;

// Stripe runtime
pub mod stripe;

// Observability
pub mod ops;

// Re-exports for convenience
pub use api::{UpdateCommand, UpdateReply, UpdateStatus};
pub use bucket::{BucketDatabase, ClusterStateView, ReplicaInfo, ReplicaSnapshot};
pub use core::config::Config;
pub use core::timestamp::Timestamp;
pub use document::{BucketId, BucketSpace, Document, DocumentId, FieldMutation};
pub use operation::{OperationContext, UpdateCoordinator};
pub use stripe::{DistributorStripe, FeedGate, MessageSender, StripeHandle, StripeState};
