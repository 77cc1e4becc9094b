//! The two-phase update coordinator.
//!
//! One coordinator owns the whole lifetime of a client update: it decides
//! between the optimistic direct-update path and the defensive
//! read-modify-write path, orchestrates the sub-operation rounds, and folds
//! every outcome into the single client reply.
//!
//! Functional outline:
//!
//! ```text
//! if bucket is consistent and all copies are in sync
//!   send updates directly to nodes
//! else
//!   start safe (slow) path:
//!     metadata gets -> newest replica -> full get
//!     if get has a document: apply mutations, put everywhere
//!     else if create-if-missing: put a blank document with the mutations
//!     else: reply not found
//! ```
//!
//! Each send state carries its own payload (fan-out tracker, captured
//! replica list, latency timer); a state is never revisited except the
//! explicit restart from consistent metadata back to direct updates.

use crate::api::storage::{
    MessageId, MessageIdAllocator, ReplyOutcome, StorageCommand, StorageCommandBody, StorageReply,
    StorageReplyBody,
};
use crate::api::update::{UpdateCommand, UpdateReply, UpdateStatus};
use crate::bucket::consistency::is_fast_path_eligible;
use crate::bucket::db::BucketDatabase;
use crate::bucket::ownership::ClusterStateView;
use crate::bucket::replica::ReplicaSnapshot;
use crate::core::config::DistributorConfig;
use crate::core::error::DistributorError;
use crate::core::timestamp::{Timestamp, TimestampSource};
use crate::document::fields::{Document, StoredDocument};
use crate::document::id::{BucketId, BucketSpace};
use crate::document::selection::Selection;
use crate::document::update::UpdateEngine;
use crate::operation::newest_replica::{select_newest, MetadataSample};
use crate::operation::reply::ReplyBuilder;
use crate::operation::sequencing::SequencingHandle;
use crate::operation::tracker::{AggregatedStatus, PersistenceMessageTracker};
use crate::ops::observability::UpdateMetrics;
use crate::stripe::{FeedGate, MessageSender};
use std::collections::HashMap;
use std::time::Instant;

/// References an operation borrows for the duration of one callback.
pub struct OperationContext<'a> {
    /// Bucket database, read-only at decision points.
    pub bucket_db: &'a BucketDatabase,

    /// Current cluster-state view for ownership checks.
    pub cluster_state: ClusterStateView,

    /// Outbound sub-command sink.
    pub sender: &'a mut dyn MessageSender,

    /// Stripe message-id allocator.
    pub ids: &'a mut MessageIdAllocator,

    /// Stripe timestamp allocator.
    pub timestamps: &'a mut TimestampSource,

    /// Update metric sampling points.
    pub metrics: &'a UpdateMetrics,

    /// Feed admission gate.
    pub feed_gate: &'a FeedGate,

    /// Update path configuration.
    pub config: &'a DistributorConfig,

    /// Bucket spaces this distributor serves.
    pub served_spaces: &'a [BucketSpace],
}

/// Which path the operation began on. Set once, never reverted; the restart
/// from consistent metadata changes the send state but not the mode, so
/// metrics keep attributing the operation to the slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    FastPath,
    SlowPath,
}

/// Replica set captured when a get round was dispatched, compared against
/// the put-time set to detect mid-flight replica changes.
type ReplicaState = Vec<(BucketId, u16)>;

#[derive(Debug)]
struct UpdatesSentPhase {
    tracker: PersistenceMessageTracker,
    started: Instant,
}

#[derive(Debug)]
struct MetadataPhase {
    pending: HashMap<MessageId, u16>,
    samples: Vec<MetadataSample>,
    failures: Vec<NodeFailure>,
    replicas_at_send: ReplicaState,
    started: Instant,
}

#[derive(Debug)]
struct SingleGetPhase {
    msg_id: MessageId,
    node: u16,
    replicas_at_get_send: ReplicaState,
    // The single-get round carries its own latency timer.
    started: Instant,
}

#[derive(Debug)]
struct FullGetsPhase {
    pending: HashMap<MessageId, u16>,
    best: Option<(u16, StoredDocument)>,
    any_success: bool,
    failures: Vec<NodeFailure>,
    replicas_at_send: ReplicaState,
    started: Instant,
}

#[derive(Debug)]
struct PutPhase {
    stage: PutStage,
}

#[derive(Debug)]
enum PutStage {
    /// Condition probes outstanding; puts not yet dispatched.
    Probing {
        pending: HashMap<MessageId, u16>,
        mismatched: bool,
        failures: Vec<NodeFailure>,
        document: Document,
        new_timestamp: Timestamp,
    },
    /// Puts outstanding.
    Writing {
        tracker: PersistenceMessageTracker,
        started: Instant,
    },
}

#[derive(Debug)]
struct NodeFailure {
    node: u16,
    outcome: ReplyOutcome,
    message: Option<String>,
}

/// Send-state machine. Allowed transitions:
///
/// ```text
/// NoneSent -> UpdatesSent | MetadataGetsSent | FullGetsSent | Done
/// MetadataGetsSent -> SingleGetSent | PutsSent | UpdatesSent (restart) | Done
/// SingleGetSent -> PutsSent | Done
/// FullGetsSent -> PutsSent | Done
/// UpdatesSent -> Done
/// PutsSent -> Done
/// ```
#[derive(Debug)]
enum SendState {
    NoneSent,
    UpdatesSent(UpdatesSentPhase),
    MetadataGetsSent(MetadataPhase),
    SingleGetSent(SingleGetPhase),
    FullGetsSent(FullGetsPhase),
    PutsSent(PutPhase),
    Done,
}

impl SendState {
    fn name(&self) -> &'static str {
        match self {
            Self::NoneSent => "NONE_SENT",
            Self::UpdatesSent(_) => "UPDATES_SENT",
            Self::MetadataGetsSent(_) => "METADATA_GETS_SENT",
            Self::SingleGetSent(_) => "SINGLE_GET_SENT",
            Self::FullGetsSent(_) => "FULL_GETS_SENT",
            Self::PutsSent(_) => "PUTS_SENT",
            Self::Done => "DONE",
        }
    }
}

/// The root aggregate of a single update operation.
pub struct UpdateCoordinator {
    command: UpdateCommand,
    selection: Option<Selection>,
    bucket: BucketId,
    mode: Option<Mode>,
    state: SendState,
    reply: ReplyBuilder,
    _sequencing: Option<SequencingHandle>,
    sequencing_acquired: bool,
}

impl UpdateCoordinator {
    /// Create an operation for a command.
    ///
    /// `sequencing` is the per-document handle the stripe acquired for this
    /// operation, or `None` when another operation holds it; start then
    /// replies busy without sending anything.
    pub fn new(mut command: UpdateCommand, sequencing: Option<SequencingHandle>) -> Self {
        let bucket = command.doc_id.bucket();
        let client_trace = std::mem::take(&mut command.trace);
        let sequencing_acquired = sequencing.is_some();
        Self {
            command,
            selection: None,
            bucket,
            mode: None,
            state: SendState::NoneSent,
            reply: ReplyBuilder::new(client_trace),
            _sequencing: sequencing,
            sequencing_acquired,
        }
    }

    /// Operation name for logs and status pages.
    pub fn name(&self) -> &'static str {
        "twophaseupdate"
    }

    /// Current send-state name.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// The path the operation began on, once started.
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// The command this operation executes.
    pub fn command(&self) -> &UpdateCommand {
        &self.command
    }

    /// Whether the single reply has been emitted.
    pub fn is_complete(&self) -> bool {
        self.reply.reply_sent()
    }

    /// Begin the operation. Returns the reply when it completes immediately.
    pub fn start(&mut self, ctx: &mut OperationContext<'_>) -> Option<UpdateReply> {
        debug_assert!(matches!(self.state, SendState::NoneSent));

        if !self.sequencing_acquired {
            return self.conclude_with_error(ctx, DistributorError::SequencingConflict {
                doc_id: self.command.doc_id.to_string(),
            });
        }
        if let Some(reason) = ctx.feed_gate.blocked_reason() {
            return self.conclude_with_error(ctx, DistributorError::FeedBlocked { reason });
        }
        if !ctx.served_spaces.contains(&self.command.space) {
            return self.conclude_with_error(ctx, DistributorError::UnsupportedBucketSpace {
                space: self.command.space.to_string(),
            });
        }
        // Parse the condition up front so a malformed selection never
        // reaches a storage node.
        if let Some(condition) = &self.command.condition {
            match Selection::parse(&condition.selection) {
                Ok(selection) => self.selection = Some(selection),
                Err(e) => {
                    let error = DistributorError::invalid_selection(format!(
                        "{:?}: {}",
                        condition.selection, e
                    ));
                    return self.conclude_with_error(ctx, error);
                }
            }
        }

        let snapshot = ctx.bucket_db.snapshot(self.command.space, self.bucket);
        if is_fast_path_eligible(&snapshot, ctx.config.force_safe_path) {
            self.mode = Some(Mode::FastPath);
            ctx.metrics.note_fast_path();
            self.reply.note(format!(
                "fast path: {} replicas in sync",
                snapshot.replicas.len()
            ));
            tracing::debug!(
                doc = %self.command.doc_id,
                bucket = %self.bucket,
                replicas = snapshot.replicas.len(),
                "dispatching direct updates"
            );
            self.state = self.send_direct_updates(ctx, &snapshot);
            None
        } else {
            self.mode = Some(Mode::SlowPath);
            ctx.metrics.note_slow_path();
            self.start_safe_path(ctx, snapshot)
        }
    }

    /// Route a sub-operation reply. Returns the final reply once all
    /// outcomes are folded.
    pub fn receive(
        &mut self,
        ctx: &mut OperationContext<'_>,
        mut reply: StorageReply,
    ) -> Option<UpdateReply> {
        if self.reply.reply_sent() {
            // Late reply after completion: absorbed silently.
            tracing::trace!(id = %reply.id, node = reply.node, "dropping late reply");
            return None;
        }
        self.reply
            .absorb_trace(std::mem::take(&mut reply.trace));

        let state = std::mem::replace(&mut self.state, SendState::Done);
        let (state, client_reply) = match state {
            SendState::UpdatesSent(phase) => self.receive_direct_update(ctx, phase, reply),
            SendState::MetadataGetsSent(phase) => self.receive_metadata_get(ctx, phase, reply),
            SendState::SingleGetSent(phase) => self.receive_single_get(ctx, phase, reply),
            SendState::FullGetsSent(phase) => self.receive_full_get(ctx, phase, reply),
            SendState::PutsSent(phase) => self.receive_put_phase(ctx, phase, reply),
            other => {
                tracing::trace!(
                    id = %reply.id,
                    state = other.name(),
                    "reply in non-receiving state dropped"
                );
                (other, None)
            }
        };
        self.state = state;
        client_reply
    }

    /// Cancel the operation. A no-op once the reply has been sent.
    pub fn cancel(&mut self) -> Option<UpdateReply> {
        self.state = SendState::Done;
        self.reply
            .finish(UpdateStatus::Cancelled, Some("operation cancelled".into()))
    }

    /// Distributor shutdown: cancellation with an aborted status.
    pub fn close(&mut self) -> Option<UpdateReply> {
        self.state = SendState::Done;
        self.reply.finish(
            UpdateStatus::Aborted,
            Some("distributor shutting down".into()),
        )
    }

    // ------------------------------------------------------------------
    // Fast path
    // ------------------------------------------------------------------

    fn send_direct_updates(
        &mut self,
        ctx: &mut OperationContext<'_>,
        snapshot: &ReplicaSnapshot,
    ) -> SendState {
        // Every replica must stamp the same new version timestamp, so the
        // distributor allocates it when the client supplied none.
        let update_timestamp = self
            .command
            .update_timestamp
            .unwrap_or_else(|| ctx.timestamps.next());
        let mut tracker = PersistenceMessageTracker::new();
        for replica in &snapshot.replicas {
            let id = ctx.ids.allocate();
            tracker.register(id, replica.node);
            ctx.sender.send(StorageCommand {
                id,
                node: replica.node,
                bucket: self.bucket,
                space: self.command.space,
                body: StorageCommandBody::Update {
                    doc_id: self.command.doc_id.clone(),
                    mutations: self.command.mutations.clone(),
                    selection: self
                        .command
                        .condition
                        .as_ref()
                        .map(|c| c.selection.clone()),
                    required_timestamp: self
                        .command
                        .condition
                        .as_ref()
                        .and_then(|c| c.required_timestamp),
                    create_if_missing: self.command.create_if_missing,
                    update_timestamp: Some(update_timestamp),
                },
            });
        }
        SendState::UpdatesSent(UpdatesSentPhase {
            tracker,
            started: Instant::now(),
        })
    }

    fn receive_direct_update(
        &mut self,
        ctx: &mut OperationContext<'_>,
        mut phase: UpdatesSentPhase,
        reply: StorageReply,
    ) -> (SendState, Option<UpdateReply>) {
        if !phase.tracker.owns(reply.id) {
            // A leftover id from before the fast-path restart.
            return (SendState::UpdatesSent(phase), None);
        }
        phase
            .tracker
            .consume(reply.id, reply.outcome, reply.message.as_deref());
        if reply.outcome.is_success() {
            if let StorageReplyBody::Update { old_timestamp } = reply.body {
                self.reply.observe_timestamp(old_timestamp);
            }
        }
        if !phase.tracker.is_complete() {
            return (SendState::UpdatesSent(phase), None);
        }

        ctx.metrics.observe_update_latency(phase.started);
        let client_reply = match phase.tracker.aggregated_status() {
            AggregatedStatus::AllOk => self.conclude(UpdateStatus::Ok, None),
            AggregatedStatus::OwnershipChanged => {
                // Replicas that did apply the update seed the repair path.
                if let Some(node) = phase.tracker.first_success_node() {
                    self.reply
                        .note(format!("ownership changed; repair source node {}", node));
                }
                self.conclude_with_error(ctx, DistributorError::OwnershipChanged {
                    bucket: self.bucket.to_string(),
                })
            }
            AggregatedStatus::ConditionFailed => {
                ctx.metrics.note_tas_failure();
                self.conclude(
                    UpdateStatus::TestAndSetFailed,
                    Some("condition failed on storage node".into()),
                )
            }
            AggregatedStatus::Failed { message } => {
                if phase.tracker.has_mixed_outcomes() {
                    // Some replicas applied the update, some did not; the
                    // replica-repair path reconciles them afterwards.
                    if let Some(node) = phase.tracker.first_success_node() {
                        self.reply
                            .note(format!("replicas diverged; repair source node {}", node));
                    }
                }
                self.conclude_with_error(ctx, DistributorError::internal(message))
            }
        };
        (SendState::Done, client_reply)
    }

    // ------------------------------------------------------------------
    // Slow path: opening rounds
    // ------------------------------------------------------------------

    fn start_safe_path(
        &mut self,
        ctx: &mut OperationContext<'_>,
        snapshot: ReplicaSnapshot,
    ) -> Option<UpdateReply> {
        if snapshot.is_empty() {
            if self.command.create_if_missing {
                self.reply.note("no replicas; creating blank document");
                let blank =
                    Document::blank(self.command.doc_id.clone(), self.command.doc_type.clone());
                let (state, reply) = self.schedule_puts(ctx, blank, Vec::new());
                self.state = state;
                return reply;
            }
            self.reply.note("no replicas; document not found");
            return self.conclude(UpdateStatus::NotFound, None);
        }

        if ctx.config.enable_metadata_phase {
            self.reply.note(format!(
                "slow path: metadata gets to {} replicas",
                snapshot.replicas.len()
            ));
            let mut pending = HashMap::new();
            for replica in &snapshot.replicas {
                let id = ctx.ids.allocate();
                pending.insert(id, replica.node);
                ctx.sender.send(StorageCommand {
                    id,
                    node: replica.node,
                    bucket: self.bucket,
                    space: self.command.space,
                    body: StorageCommandBody::MetadataGet {
                        doc_id: self.command.doc_id.clone(),
                    },
                });
            }
            self.state = SendState::MetadataGetsSent(MetadataPhase {
                pending,
                samples: Vec::new(),
                failures: Vec::new(),
                replicas_at_send: snapshot.replica_state(),
                started: Instant::now(),
            });
        } else {
            // Without the metadata round, one full get per distinct content
            // signature is enough: replicas sharing (doc-count, checksum)
            // hold the same bytes.
            let mut signatures = Vec::new();
            let mut targets = Vec::new();
            for replica in &snapshot.replicas {
                if !signatures.contains(&replica.content_signature()) {
                    signatures.push(replica.content_signature());
                    targets.push(replica.node);
                }
            }
            self.reply.note(format!(
                "slow path: full gets to {} checksum groups",
                targets.len()
            ));
            let mut pending = HashMap::new();
            for node in targets {
                let id = ctx.ids.allocate();
                pending.insert(id, node);
                ctx.sender.send(StorageCommand {
                    id,
                    node,
                    bucket: self.bucket,
                    space: self.command.space,
                    body: StorageCommandBody::FullGet {
                        doc_id: self.command.doc_id.clone(),
                    },
                });
            }
            self.state = SendState::FullGetsSent(FullGetsPhase {
                pending,
                best: None,
                any_success: false,
                failures: Vec::new(),
                replicas_at_send: snapshot.replica_state(),
                started: Instant::now(),
            });
        }
        None
    }

    // ------------------------------------------------------------------
    // Slow path: metadata round
    // ------------------------------------------------------------------

    fn receive_metadata_get(
        &mut self,
        ctx: &mut OperationContext<'_>,
        mut phase: MetadataPhase,
        reply: StorageReply,
    ) -> (SendState, Option<UpdateReply>) {
        let Some(node) = phase.pending.remove(&reply.id) else {
            return (SendState::MetadataGetsSent(phase), None);
        };
        if reply.outcome.is_success() {
            if let StorageReplyBody::MetadataGet {
                persisted_timestamp,
                checksum,
            } = reply.body
            {
                self.reply.observe_timestamp(persisted_timestamp);
                phase.samples.push(MetadataSample {
                    node,
                    persisted_timestamp,
                    checksum,
                });
            }
        } else {
            phase.failures.push(NodeFailure {
                node,
                outcome: reply.outcome,
                message: reply.message,
            });
        }
        if !phase.pending.is_empty() {
            return (SendState::MetadataGetsSent(phase), None);
        }

        ctx.metrics.observe_metadata_get_latency(phase.started);
        self.metadata_round_complete(ctx, phase)
    }

    fn metadata_round_complete(
        &mut self,
        ctx: &mut OperationContext<'_>,
        phase: MetadataPhase,
    ) -> (SendState, Option<UpdateReply>) {
        if phase.samples.is_empty() {
            if phase.failures.is_empty() {
                // Replica set was non-empty at send time, so every reply
                // carried a sample or a failure; an empty round means the
                // document is simply absent everywhere.
                return self.document_absent(ctx, phase.replicas_at_send);
            }
            let reply = self.conclude_from_failures(ctx, &phase.failures);
            return (SendState::Done, reply);
        }

        let Some(newest) = select_newest(&phase.samples) else {
            return self.document_absent(ctx, phase.replicas_at_send);
        };

        if !newest.persisted_timestamp.is_set() {
            // Every successful replica reports no stored version.
            return self.document_absent(ctx, phase.replicas_at_send);
        }

        if self.may_restart_with_fast_path(ctx, &phase) {
            ctx.metrics.note_fast_path_restart();
            self.reply
                .note("metadata consistent; restarting with direct updates");
            tracing::debug!(
                doc = %self.command.doc_id,
                bucket = %self.bucket,
                "consistent metadata timestamps, restarting with fast path"
            );
            let snapshot = ctx.bucket_db.snapshot(self.command.space, self.bucket);
            let state = self.send_direct_updates(ctx, &snapshot);
            return (state, None);
        }

        // Full get from the newest replica only.
        if self.lost_bucket_ownership(ctx) {
            let reply = self.send_lost_ownership_reply(ctx);
            return (SendState::Done, reply);
        }
        let id = ctx.ids.allocate();
        self.reply.note(format!(
            "full get from node {} at {}",
            newest.node, newest.persisted_timestamp
        ));
        ctx.sender.send(StorageCommand {
            id,
            node: newest.node,
            bucket: self.bucket,
            space: self.command.space,
            body: StorageCommandBody::FullGet {
                doc_id: self.command.doc_id.clone(),
            },
        });
        (
            SendState::SingleGetSent(SingleGetPhase {
                msg_id: id,
                node: newest.node,
                replicas_at_get_send: phase.replicas_at_send,
                started: Instant::now(),
            }),
            None,
        )
    }

    /// Restart is allowed only when the metadata round proves the replicas
    /// are already in sync: every reply succeeded, every persisted-timestamp
    /// and checksum is identical, and the replica set has not changed since
    /// the round was dispatched.
    fn may_restart_with_fast_path(
        &self,
        ctx: &OperationContext<'_>,
        phase: &MetadataPhase,
    ) -> bool {
        if !phase.failures.is_empty() {
            return false;
        }
        let first = &phase.samples[0];
        let consistent = phase.samples.iter().all(|s| {
            s.persisted_timestamp == first.persisted_timestamp && s.checksum == first.checksum
        });
        consistent && self.replica_set_unchanged(ctx, &phase.replicas_at_send)
    }

    fn replica_set_unchanged(
        &self,
        ctx: &OperationContext<'_>,
        replicas_at_send: &ReplicaState,
    ) -> bool {
        let current = ctx
            .bucket_db
            .snapshot(self.command.space, self.bucket)
            .replica_state();
        current == *replicas_at_send
    }

    // ------------------------------------------------------------------
    // Slow path: full-get rounds
    // ------------------------------------------------------------------

    fn receive_single_get(
        &mut self,
        ctx: &mut OperationContext<'_>,
        phase: SingleGetPhase,
        reply: StorageReply,
    ) -> (SendState, Option<UpdateReply>) {
        if reply.id != phase.msg_id {
            return (SendState::SingleGetSent(phase), None);
        }
        ctx.metrics.observe_single_get_latency(phase.started);

        if !reply.outcome.is_success() {
            let failures = vec![NodeFailure {
                node: phase.node,
                outcome: reply.outcome,
                message: reply.message,
            }];
            let client_reply = self.conclude_from_failures(ctx, &failures);
            return (SendState::Done, client_reply);
        }
        let document = match reply.body {
            StorageReplyBody::FullGet { document } => document,
            _ => None,
        };
        self.full_get_complete(ctx, document, phase.replicas_at_get_send)
    }

    fn receive_full_get(
        &mut self,
        ctx: &mut OperationContext<'_>,
        mut phase: FullGetsPhase,
        reply: StorageReply,
    ) -> (SendState, Option<UpdateReply>) {
        let Some(node) = phase.pending.remove(&reply.id) else {
            return (SendState::FullGetsSent(phase), None);
        };
        if reply.outcome.is_success() {
            phase.any_success = true;
            if let StorageReplyBody::FullGet {
                document: Some(stored),
            } = reply.body
            {
                self.reply.observe_timestamp(stored.persisted_timestamp);
                let replace = match &phase.best {
                    None => true,
                    Some((best_node, best)) => {
                        stored.persisted_timestamp > best.persisted_timestamp
                            || (stored.persisted_timestamp == best.persisted_timestamp
                                && node < *best_node)
                    }
                };
                if replace {
                    phase.best = Some((node, stored));
                }
            }
        } else {
            phase.failures.push(NodeFailure {
                node,
                outcome: reply.outcome,
                message: reply.message,
            });
        }
        if !phase.pending.is_empty() {
            return (SendState::FullGetsSent(phase), None);
        }

        ctx.metrics.observe_single_get_latency(phase.started);
        if !phase.any_success {
            let client_reply = self.conclude_from_failures(ctx, &phase.failures);
            return (SendState::Done, client_reply);
        }
        let document = phase.best.map(|(_, stored)| stored);
        self.full_get_complete(ctx, document, phase.replicas_at_send)
    }

    fn full_get_complete(
        &mut self,
        ctx: &mut OperationContext<'_>,
        document: Option<StoredDocument>,
        replicas_at_get_send: ReplicaState,
    ) -> (SendState, Option<UpdateReply>) {
        let Some(stored) = document else {
            return self.document_absent(ctx, replicas_at_get_send);
        };
        let persisted = stored.persisted_timestamp;
        self.reply.observe_timestamp(persisted);

        if let Some(update_ts) = self.command.update_timestamp {
            if !satisfies_update_timestamp_constraint(update_ts, persisted) {
                let reply = self.conclude_with_error(ctx, DistributorError::TimestampConflict {
                    update: update_ts.as_micros(),
                    persisted: persisted.as_micros(),
                });
                return (SendState::Done, reply);
            }
        }

        if let Some(condition) = &self.command.condition {
            let satisfied_by_timestamp = condition.required_timestamp == Some(persisted);
            if satisfied_by_timestamp {
                // The stored version is exactly the one the client saw; the
                // predicate held then and the version has not moved.
                self.reply
                    .note("condition satisfied by required timestamp");
            } else if let Some(selection) = &self.selection {
                if !selection.evaluate(&stored.document) {
                    ctx.metrics.note_tas_failure();
                    let source = selection.source().to_string();
                    let reply = self.conclude(
                        UpdateStatus::TestAndSetFailed,
                        Some(format!("condition '{}' not met", source)),
                    );
                    return (SendState::Done, reply);
                }
            }
        }

        let mut updated = stored.document;
        if let Err(e) = UpdateEngine.apply(&mut updated, &self.command.mutations) {
            let reply = self
                .conclude_with_error(ctx, DistributorError::internal(format!("apply failed: {}", e)));
            return (SendState::Done, reply);
        }
        self.schedule_puts(ctx, updated, replicas_at_get_send)
    }

    fn document_absent(
        &mut self,
        ctx: &mut OperationContext<'_>,
        replicas_at_get_send: ReplicaState,
    ) -> (SendState, Option<UpdateReply>) {
        if self.command.create_if_missing {
            self.reply.note("document absent; creating blank document");
            let mut blank =
                Document::blank(self.command.doc_id.clone(), self.command.doc_type.clone());
            if let Err(e) = UpdateEngine.apply(&mut blank, &self.command.mutations) {
                let reply = self.conclude_with_error(
                    ctx,
                    DistributorError::internal(format!("apply failed: {}", e)),
                );
                return (SendState::Done, reply);
            }
            self.schedule_puts(ctx, blank, replicas_at_get_send)
        } else {
            let reply = self.conclude(UpdateStatus::NotFound, None);
            (SendState::Done, reply)
        }
    }

    // ------------------------------------------------------------------
    // Slow path: put round (with optional condition probes)
    // ------------------------------------------------------------------

    fn schedule_puts(
        &mut self,
        ctx: &mut OperationContext<'_>,
        document: Document,
        replicas_at_get_send: ReplicaState,
    ) -> (SendState, Option<UpdateReply>) {
        if self.lost_bucket_ownership(ctx) {
            let reply = self.send_lost_ownership_reply(ctx);
            return (SendState::Done, reply);
        }

        let observed = self.reply.max_observed_timestamp();
        let new_timestamp = match self.command.update_timestamp {
            Some(explicit) => {
                if !satisfies_update_timestamp_constraint(explicit, observed) {
                    let reply = self.conclude_with_error(ctx, DistributorError::TimestampConflict {
                        update: explicit.as_micros(),
                        persisted: observed.as_micros(),
                    });
                    return (SendState::Done, reply);
                }
                explicit
            }
            None => ctx.timestamps.next_after(observed),
        };

        // Replica set re-read at put time.
        let snapshot = ctx.bucket_db.snapshot(self.command.space, self.bucket);
        if snapshot.is_empty() {
            let reply = self.conclude_with_error(
                ctx,
                DistributorError::internal(format!(
                    "bucket {} has no replicas to write",
                    self.bucket
                )),
            );
            return (SendState::Done, reply);
        }

        let replicas_changed = snapshot.replica_state() != replicas_at_get_send;
        let probe_selection = if replicas_changed {
            self.command.condition.as_ref().map(|c| c.selection.clone())
        } else {
            None
        };
        if let Some(selection_source) = probe_selection {
            // The condition was checked against a replica set that no longer
            // matches; probe the current replicas before writing anything.
            self.reply.note(format!(
                "replica set changed; probing condition on {} replicas",
                snapshot.replicas.len()
            ));
            let mut pending = HashMap::new();
            for replica in &snapshot.replicas {
                let id = ctx.ids.allocate();
                pending.insert(id, replica.node);
                ctx.sender.send(StorageCommand {
                    id,
                    node: replica.node,
                    bucket: self.bucket,
                    space: self.command.space,
                    body: StorageCommandBody::ConditionProbe {
                        doc_id: self.command.doc_id.clone(),
                        selection: selection_source.clone(),
                    },
                });
            }
            return (
                SendState::PutsSent(PutPhase {
                    stage: PutStage::Probing {
                        pending,
                        mismatched: false,
                        failures: Vec::new(),
                        document,
                        new_timestamp,
                    },
                }),
                None,
            );
        }

        self.dispatch_puts(ctx, document, new_timestamp, &snapshot)
    }

    fn dispatch_puts(
        &mut self,
        ctx: &mut OperationContext<'_>,
        document: Document,
        new_timestamp: Timestamp,
        snapshot: &ReplicaSnapshot,
    ) -> (SendState, Option<UpdateReply>) {
        let payload = match document.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                let reply = self.conclude_with_error(ctx, e);
                return (SendState::Done, reply);
            }
        };
        self.reply.note(format!(
            "puts to {} replicas at {}",
            snapshot.replicas.len(),
            new_timestamp
        ));
        let mut tracker = PersistenceMessageTracker::new();
        for replica in &snapshot.replicas {
            let id = ctx.ids.allocate();
            tracker.register(id, replica.node);
            ctx.sender.send(StorageCommand {
                id,
                node: replica.node,
                bucket: self.bucket,
                space: self.command.space,
                body: StorageCommandBody::Put {
                    doc_id: self.command.doc_id.clone(),
                    payload: payload.clone(),
                    new_timestamp,
                },
            });
        }
        (
            SendState::PutsSent(PutPhase {
                stage: PutStage::Writing {
                    tracker,
                    started: Instant::now(),
                },
            }),
            None,
        )
    }

    fn receive_put_phase(
        &mut self,
        ctx: &mut OperationContext<'_>,
        phase: PutPhase,
        reply: StorageReply,
    ) -> (SendState, Option<UpdateReply>) {
        match phase.stage {
            PutStage::Probing {
                mut pending,
                mut mismatched,
                mut failures,
                document,
                new_timestamp,
            } => {
                let Some(node) = pending.remove(&reply.id) else {
                    return (
                        SendState::PutsSent(PutPhase {
                            stage: PutStage::Probing {
                                pending,
                                mismatched,
                                failures,
                                document,
                                new_timestamp,
                            },
                        }),
                        None,
                    );
                };
                if reply.outcome.is_success() {
                    if let StorageReplyBody::ConditionProbe {
                        matched,
                        document_found,
                    } = reply.body
                    {
                        let passes = matched
                            || (!document_found && self.command.create_if_missing);
                        if !passes {
                            mismatched = true;
                        }
                    }
                } else {
                    failures.push(NodeFailure {
                        node,
                        outcome: reply.outcome,
                        message: reply.message,
                    });
                }
                if !pending.is_empty() {
                    return (
                        SendState::PutsSent(PutPhase {
                            stage: PutStage::Probing {
                                pending,
                                mismatched,
                                failures,
                                document,
                                new_timestamp,
                            },
                        }),
                        None,
                    );
                }
                if !failures.is_empty() {
                    let client_reply = self.conclude_from_failures(ctx, &failures);
                    return (SendState::Done, client_reply);
                }
                if mismatched {
                    ctx.metrics.note_tas_failure();
                    let client_reply = self.conclude(
                        UpdateStatus::TestAndSetFailed,
                        Some("condition not met on current replicas".into()),
                    );
                    return (SendState::Done, client_reply);
                }
                let snapshot = ctx.bucket_db.snapshot(self.command.space, self.bucket);
                if snapshot.is_empty() {
                    let client_reply = self.conclude_with_error(
                        ctx,
                        DistributorError::internal(format!(
                            "bucket {} has no replicas to write",
                            self.bucket
                        )),
                    );
                    return (SendState::Done, client_reply);
                }
                self.dispatch_puts(ctx, document, new_timestamp, &snapshot)
            }
            PutStage::Writing {
                mut tracker,
                started,
            } => {
                if tracker
                    .consume(reply.id, reply.outcome, reply.message.as_deref())
                    .is_none()
                {
                    return (
                        SendState::PutsSent(PutPhase {
                            stage: PutStage::Writing { tracker, started },
                        }),
                        None,
                    );
                }
                if !tracker.is_complete() {
                    return (
                        SendState::PutsSent(PutPhase {
                            stage: PutStage::Writing { tracker, started },
                        }),
                        None,
                    );
                }
                ctx.metrics.observe_put_latency(started);
                let client_reply = match tracker.aggregated_status() {
                    AggregatedStatus::AllOk => self.conclude(UpdateStatus::Ok, None),
                    AggregatedStatus::OwnershipChanged => {
                        self.conclude_with_error(ctx, DistributorError::OwnershipChanged {
                            bucket: self.bucket.to_string(),
                        })
                    }
                    AggregatedStatus::ConditionFailed => {
                        // Puts carry no condition; a node reporting one is
                        // misbehaving, fold it into the failure path.
                        self.conclude_with_error(
                            ctx,
                            DistributorError::internal("unexpected condition failure on put"),
                        )
                    }
                    AggregatedStatus::Failed { message } => {
                        if tracker.has_mixed_outcomes() {
                            self.reply
                                .note("put outcomes diverged; left for replica repair");
                        }
                        self.conclude_with_error(ctx, DistributorError::internal(message))
                    }
                };
                (SendState::Done, client_reply)
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn lost_bucket_ownership(&self, ctx: &OperationContext<'_>) -> bool {
        !ctx.cluster_state.owns_bucket(self.bucket)
    }

    fn send_lost_ownership_reply(
        &mut self,
        ctx: &mut OperationContext<'_>,
    ) -> Option<UpdateReply> {
        tracing::debug!(
            doc = %self.command.doc_id,
            bucket = %self.bucket,
            "bucket ownership lost between phases"
        );
        self.conclude_with_error(ctx, DistributorError::OwnershipChanged {
            bucket: self.bucket.to_string(),
        })
    }

    fn conclude_from_failures(
        &mut self,
        ctx: &mut OperationContext<'_>,
        failures: &[NodeFailure],
    ) -> Option<UpdateReply> {
        if failures.iter().any(|f| f.outcome.is_ownership_change()) {
            return self.conclude_with_error(ctx, DistributorError::OwnershipChanged {
                bucket: self.bucket.to_string(),
            });
        }
        let message = failures
            .iter()
            .find_map(|f| f.message.clone())
            .unwrap_or_else(|| "sub-operation failed".to_string());
        self.conclude_with_error(ctx, DistributorError::internal(message))
    }

    fn conclude(&mut self, status: UpdateStatus, message: Option<String>) -> Option<UpdateReply> {
        self.state = SendState::Done;
        tracing::debug!(
            doc = %self.command.doc_id,
            bucket = %self.bucket,
            status = %status,
            "update operation complete"
        );
        self.reply.finish(status, message)
    }

    /// Fold a distributor error into the single reply: the error decides the
    /// status, its rendering becomes the reply message, and ownership
    /// changes are counted here so every path samples the metric.
    fn conclude_with_error(
        &mut self,
        ctx: &mut OperationContext<'_>,
        error: DistributorError,
    ) -> Option<UpdateReply> {
        if matches!(error, DistributorError::OwnershipChanged { .. }) {
            ctx.metrics.note_ownership_change();
        }
        let status = error.reply_status();
        self.state = SendState::Done;
        tracing::debug!(
            doc = %self.command.doc_id,
            bucket = %self.bucket,
            status = %status,
            retriable = error.is_retriable(),
            "update operation failed: {}",
            error
        );
        self.reply.finish(status, Some(error.to_string()))
    }
}

/// An explicit update-timestamp must order strictly after the persisted
/// version it supersedes.
fn satisfies_update_timestamp_constraint(update: Timestamp, persisted: Timestamp) -> bool {
    update > persisted
}
