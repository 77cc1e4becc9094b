//! Distributor stripe.
//!
//! A stripe runs every operation for its share of the bucket space on one
//! cooperative task: commands arrive as events, sub-operation replies arrive
//! as events, and each callback runs to completion before the next is
//! dispatched. Operations therefore need no internal locking; all their
//! state is borrowed mutably for exactly one callback at a time.

use crate::api::storage::{MessageId, MessageIdAllocator, StorageCommand, StorageReply};
use crate::api::update::{UpdateCommand, UpdateReply};
use crate::bucket::db::BucketDatabase;
use crate::bucket::ownership::ClusterStateView;
use crate::core::config::{Config, DistributorConfig};
use crate::core::timestamp::{Timestamp, TimestampSource};
use crate::document::id::BucketSpace;
use crate::operation::coordinator::{OperationContext, UpdateCoordinator};
use crate::operation::sequencing::Sequencer;
use crate::ops::observability::{metrics, UpdateMetrics};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Outbound sub-command sink.
///
/// The transport behind it is free to deliver replies in any order; the
/// operations only act when their trackers declare a fan-out complete.
pub trait MessageSender {
    /// Send one sub-command toward its storage node.
    fn send(&mut self, command: StorageCommand);
}

/// Feed admission gate.
///
/// The surrounding feed layer closes the gate under resource pressure; a
/// closed gate rejects new updates at start with a feed-blocked reply.
#[derive(Debug, Clone, Default)]
pub struct FeedGate {
    blocked: Arc<Mutex<Option<String>>>,
}

impl FeedGate {
    /// An open gate.
    pub fn open() -> Self {
        Self::default()
    }

    /// Close the gate with a reason reported to rejected clients.
    pub fn close(&self, reason: impl Into<String>) {
        *self.blocked.lock() = Some(reason.into());
    }

    /// Reopen the gate.
    pub fn reopen(&self) {
        *self.blocked.lock() = None;
    }

    /// Whether the gate is closed.
    pub fn is_blocked(&self) -> bool {
        self.blocked.lock().is_some()
    }

    /// The closure reason, when closed.
    pub fn blocked_reason(&self) -> Option<String> {
        self.blocked.lock().clone()
    }
}

/// Identifier of one in-flight operation on a stripe.
pub type OperationId = u64;

/// Outcome of submitting a command to the stripe state.
#[derive(Debug)]
pub enum BeginOutcome {
    /// The operation completed during start.
    Immediate(UpdateReply),
    /// Sub-operations are in flight; the reply arrives later.
    InFlight(OperationId),
}

/// Records the ids an operation sends during one callback so the stripe can
/// route the replies back.
struct RecordingSender<'a> {
    inner: &'a mut dyn MessageSender,
    sent: Vec<MessageId>,
}

impl<'a> RecordingSender<'a> {
    fn new(inner: &'a mut dyn MessageSender) -> Self {
        Self {
            inner,
            sent: Vec::new(),
        }
    }
}

impl MessageSender for RecordingSender<'_> {
    fn send(&mut self, command: StorageCommand) {
        self.sent.push(command.id);
        self.inner.send(command);
    }
}

/// The synchronous stripe core: bucket database, cluster view, and the set
/// of in-flight operations. The async event loop drives it; tests can drive
/// it directly.
pub struct StripeState {
    bucket_db: BucketDatabase,
    cluster_state: ClusterStateView,
    config: DistributorConfig,
    served_spaces: Vec<BucketSpace>,
    sequencer: Sequencer,
    ids: MessageIdAllocator,
    timestamps: TimestampSource,
    metrics: UpdateMetrics,
    feed_gate: FeedGate,
    operations: HashMap<OperationId, UpdateCoordinator>,
    routes: HashMap<MessageId, OperationId>,
    next_operation: OperationId,
}

impl StripeState {
    /// Create a stripe core from configuration.
    pub fn new(config: &Config, metrics: UpdateMetrics) -> Self {
        let cluster_state = ClusterStateView::new(
            config.cluster.state_version,
            config.cluster.distributor_count,
            config.cluster.distributor_index,
        );
        let served_spaces = config
            .cluster
            .bucket_spaces
            .iter()
            .filter_map(|name| BucketSpace::from_name(name))
            .collect();
        let feed_gate = FeedGate::open();
        if config.feed.initially_blocked {
            feed_gate.close(
                config
                    .feed
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "feed blocked by configuration".to_string()),
            );
        }
        Self {
            bucket_db: BucketDatabase::new(),
            cluster_state,
            config: config.distributor.clone(),
            served_spaces,
            sequencer: Sequencer::new(),
            ids: MessageIdAllocator::new(),
            timestamps: TimestampSource::with_floor(Timestamp::from_micros(
                config.timestamps.floor_micros,
            )),
            metrics,
            feed_gate,
            operations: HashMap::new(),
            routes: HashMap::new(),
            next_operation: 1,
        }
    }

    /// The bucket database, for the database owner to maintain.
    pub fn bucket_db_mut(&mut self) -> &mut BucketDatabase {
        &mut self.bucket_db
    }

    /// Read access to the bucket database.
    pub fn bucket_db(&self) -> &BucketDatabase {
        &self.bucket_db
    }

    /// Install a new cluster-state view (redistribution).
    pub fn set_cluster_state(&mut self, view: ClusterStateView) {
        self.cluster_state = view;
    }

    /// The feed admission gate.
    pub fn feed_gate(&self) -> &FeedGate {
        &self.feed_gate
    }

    /// The metric sampling points.
    pub fn metrics(&self) -> &UpdateMetrics {
        &self.metrics
    }

    /// Number of in-flight operations.
    pub fn active_operations(&self) -> usize {
        self.operations.len()
    }

    /// Start an update operation.
    pub fn begin_update(
        &mut self,
        command: UpdateCommand,
        transport: &mut dyn MessageSender,
    ) -> BeginOutcome {
        let sequencing = self.sequencer.try_acquire(&command.doc_id);
        let mut operation = UpdateCoordinator::new(command, sequencing);

        let mut recording = RecordingSender::new(transport);
        let reply = {
            let mut ctx = OperationContext {
                bucket_db: &self.bucket_db,
                cluster_state: self.cluster_state,
                sender: &mut recording,
                ids: &mut self.ids,
                timestamps: &mut self.timestamps,
                metrics: &self.metrics,
                feed_gate: &self.feed_gate,
                config: &self.config,
                served_spaces: &self.served_spaces,
            };
            operation.start(&mut ctx)
        };
        match reply {
            Some(reply) => BeginOutcome::Immediate(reply),
            None => {
                let operation_id = self.next_operation;
                self.next_operation += 1;
                for id in recording.sent {
                    self.routes.insert(id, operation_id);
                }
                self.operations.insert(operation_id, operation);
                self.update_active_gauge();
                BeginOutcome::InFlight(operation_id)
            }
        }
    }

    /// Route a storage reply to its operation.
    ///
    /// Returns the operation's final reply when this storage reply completed
    /// it. Replies for unknown or already-completed operations are dropped.
    pub fn receive_storage_reply(
        &mut self,
        reply: StorageReply,
        transport: &mut dyn MessageSender,
    ) -> Option<(OperationId, UpdateReply)> {
        let operation_id = self.routes.remove(&reply.id)?;
        let Some(operation) = self.operations.get_mut(&operation_id) else {
            tracing::trace!(id = %reply.id, "reply for completed operation dropped");
            return None;
        };

        let mut recording = RecordingSender::new(transport);
        let client_reply = {
            let mut ctx = OperationContext {
                bucket_db: &self.bucket_db,
                cluster_state: self.cluster_state,
                sender: &mut recording,
                ids: &mut self.ids,
                timestamps: &mut self.timestamps,
                metrics: &self.metrics,
                feed_gate: &self.feed_gate,
                config: &self.config,
                served_spaces: &self.served_spaces,
            };
            operation.receive(&mut ctx, reply)
        };
        for id in recording.sent {
            self.routes.insert(id, operation_id);
        }
        match client_reply {
            Some(reply) => {
                self.operations.remove(&operation_id);
                self.update_active_gauge();
                Some((operation_id, reply))
            }
            None => None,
        }
    }

    /// Cancel one in-flight operation.
    pub fn cancel(&mut self, operation_id: OperationId) -> Option<UpdateReply> {
        let operation = self.operations.get_mut(&operation_id)?;
        let reply = operation.cancel();
        self.operations.remove(&operation_id);
        self.update_active_gauge();
        reply
    }

    /// Abort every in-flight operation (shutdown).
    pub fn close_all(&mut self) -> Vec<(OperationId, UpdateReply)> {
        let mut replies = Vec::new();
        for (operation_id, mut operation) in self.operations.drain() {
            if let Some(reply) = operation.close() {
                replies.push((operation_id, reply));
            }
        }
        self.routes.clear();
        self.update_active_gauge();
        replies
    }

    fn update_active_gauge(&self) {
        self.metrics
            .registry()
            .gauge_set(metrics::STRIPE_ACTIVE_OPERATIONS, self.operations.len() as u64);
    }
}

/// Events delivered to the stripe task.
pub enum StripeEvent {
    /// A client update command.
    Update {
        command: UpdateCommand,
        respond_to: oneshot::Sender<UpdateReply>,
    },
    /// A storage sub-command reply.
    StorageReply(StorageReply),
    /// Cancel one in-flight operation.
    Cancel(OperationId),
}

/// Handle for submitting work to a running stripe.
#[derive(Clone)]
pub struct StripeHandle {
    events: mpsc::Sender<StripeEvent>,
}

impl StripeHandle {
    /// Submit an update and await its single reply.
    pub async fn update(&self, command: UpdateCommand) -> anyhow::Result<UpdateReply> {
        let (respond_to, reply) = oneshot::channel();
        self.events
            .send(StripeEvent::Update {
                command,
                respond_to,
            })
            .await
            .map_err(|_| anyhow::anyhow!("stripe is gone"))?;
        reply
            .await
            .map_err(|_| anyhow::anyhow!("stripe dropped the operation"))
    }

    /// Deliver a storage reply to the stripe.
    pub async fn deliver_storage_reply(&self, reply: StorageReply) -> anyhow::Result<()> {
        self.events
            .send(StripeEvent::StorageReply(reply))
            .await
            .map_err(|_| anyhow::anyhow!("stripe is gone"))
    }
}

/// The stripe task: a single-threaded cooperative event loop.
pub struct DistributorStripe {
    state: StripeState,
    transport: Box<dyn MessageSender + Send>,
    events: mpsc::Receiver<StripeEvent>,
    shutdown: watch::Receiver<bool>,
    responders: HashMap<OperationId, oneshot::Sender<UpdateReply>>,
}

impl DistributorStripe {
    /// Build a stripe and its submission handle.
    ///
    /// `shutdown` flips to true to stop the loop; in-flight operations are
    /// aborted and their clients receive aborted replies.
    pub fn new(
        config: &Config,
        metrics: UpdateMetrics,
        transport: Box<dyn MessageSender + Send>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, StripeHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.distributor.stripe_queue_depth);
        let stripe = Self {
            state: StripeState::new(config, metrics),
            transport,
            events: events_rx,
            shutdown,
            responders: HashMap::new(),
        };
        (stripe, StripeHandle { events: events_tx })
    }

    /// The stripe core, for pre-run setup (bucket database seeding).
    pub fn state_mut(&mut self) -> &mut StripeState {
        &mut self.state
    }

    /// Run the event loop until shutdown or the last handle drops.
    pub async fn run(mut self) {
        tracing::info!("distributor stripe started");
        enum Next {
            Event(StripeEvent),
            Stop,
            Continue,
        }
        loop {
            let next = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        Next::Stop
                    } else {
                        Next::Continue
                    }
                }
                event = self.events.recv() => match event {
                    None => Next::Stop,
                    Some(event) => Next::Event(event),
                },
            };
            match next {
                Next::Event(event) => self.handle_event(event),
                Next::Stop => break,
                Next::Continue => {}
            }
        }
        for (operation_id, reply) in self.state.close_all() {
            if let Some(respond_to) = self.responders.remove(&operation_id) {
                let _ = respond_to.send(reply);
            }
        }
        tracing::info!("distributor stripe stopped");
    }

    fn handle_event(&mut self, event: StripeEvent) {
        match event {
            StripeEvent::Update {
                command,
                respond_to,
            } => match self.state.begin_update(command, self.transport.as_mut()) {
                BeginOutcome::Immediate(reply) => {
                    let _ = respond_to.send(reply);
                }
                BeginOutcome::InFlight(operation_id) => {
                    self.responders.insert(operation_id, respond_to);
                }
            },
            StripeEvent::StorageReply(reply) => {
                if let Some((operation_id, reply)) =
                    self.state.receive_storage_reply(reply, self.transport.as_mut())
                {
                    if let Some(respond_to) = self.responders.remove(&operation_id) {
                        let _ = respond_to.send(reply);
                    }
                }
            }
            StripeEvent::Cancel(operation_id) => {
                if let Some(reply) = self.state.cancel(operation_id) {
                    if let Some(respond_to) = self.responders.remove(&operation_id) {
                        let _ = respond_to.send(reply);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_gate_toggles() {
        let gate = FeedGate::open();
        assert!(!gate.is_blocked());
        gate.close("resource pressure");
        assert_eq!(gate.blocked_reason().as_deref(), Some("resource pressure"));
        gate.reopen();
        assert!(!gate.is_blocked());
    }
}
