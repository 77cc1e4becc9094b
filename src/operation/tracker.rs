//! Persistence message tracker.
//!
//! A pure value that counts outstanding per-node replies for one batched
//! multi-node send and folds the per-node outcomes into a single aggregated
//! status. The owning state decides what the aggregate means; the tracker
//! only classifies.

use crate::api::storage::{MessageId, ReplyOutcome};
use std::collections::HashMap;

/// Aggregated outcome of a completed fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatedStatus {
    /// Every node succeeded.
    AllOk,
    /// At least one node reported an ownership change.
    OwnershipChanged,
    /// At least one node reported a failed condition (and none reported an
    /// ownership change).
    ConditionFailed,
    /// At least one node failed hard.
    Failed { message: String },
}

/// Counts outstanding replies for one fan-out and aggregates outcomes.
#[derive(Debug, Default)]
pub struct PersistenceMessageTracker {
    pending: HashMap<MessageId, u16>,
    outcomes: Vec<(u16, ReplyOutcome)>,
    first_failure_message: Option<String>,
    first_success_node: Option<u16>,
}

impl PersistenceMessageTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound message.
    pub fn register(&mut self, id: MessageId, node: u16) {
        self.pending.insert(id, node);
    }

    /// Consume a reply.
    ///
    /// Returns the node the message was sent to, or `None` for an unknown
    /// (late or foreign) id.
    pub fn consume(
        &mut self,
        id: MessageId,
        outcome: ReplyOutcome,
        message: Option<&str>,
    ) -> Option<u16> {
        let node = self.pending.remove(&id)?;
        if outcome.is_success() {
            self.first_success_node.get_or_insert(node);
        } else if self.first_failure_message.is_none() {
            self.first_failure_message =
                Some(message.map_or_else(|| format!("{:?}", outcome), str::to_string));
        }
        self.outcomes.push((node, outcome));
        Some(node)
    }

    /// Whether a message id belongs to this fan-out.
    pub fn owns(&self, id: MessageId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Whether every registered message has been answered.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of replies still outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// First node that reported success, if any.
    pub fn first_success_node(&self) -> Option<u16> {
        self.first_success_node
    }

    /// Whether outcomes were mixed: some nodes succeeded, some failed.
    pub fn has_mixed_outcomes(&self) -> bool {
        let successes = self.outcomes.iter().filter(|(_, o)| o.is_success()).count();
        successes > 0 && successes < self.outcomes.len()
    }

    /// Fold the collected outcomes.
    ///
    /// Ownership changes dominate, then condition failures, then any other
    /// failure; only an all-success fan-out aggregates to `AllOk`.
    pub fn aggregated_status(&self) -> AggregatedStatus {
        debug_assert!(self.is_complete());
        if self
            .outcomes
            .iter()
            .any(|(_, o)| o.is_ownership_change())
        {
            return AggregatedStatus::OwnershipChanged;
        }
        if self
            .outcomes
            .iter()
            .any(|(_, o)| *o == ReplyOutcome::TestAndSetFailed)
        {
            return AggregatedStatus::ConditionFailed;
        }
        if self.outcomes.iter().all(|(_, o)| o.is_success()) {
            return AggregatedStatus::AllOk;
        }
        AggregatedStatus::Failed {
            message: self
                .first_failure_message
                .clone()
                .unwrap_or_else(|| "sub-operation failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> MessageId {
        MessageId(raw)
    }

    #[test]
    fn complete_only_after_all_replies() {
        let mut tracker = PersistenceMessageTracker::new();
        tracker.register(id(1), 0);
        tracker.register(id(2), 1);
        assert!(!tracker.is_complete());

        tracker.consume(id(1), ReplyOutcome::Ok, None);
        assert!(!tracker.is_complete());
        tracker.consume(id(2), ReplyOutcome::Ok, None);
        assert!(tracker.is_complete());
        assert_eq!(tracker.aggregated_status(), AggregatedStatus::AllOk);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut tracker = PersistenceMessageTracker::new();
        tracker.register(id(1), 0);
        assert_eq!(tracker.consume(id(99), ReplyOutcome::Ok, None), None);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn ownership_change_dominates() {
        let mut tracker = PersistenceMessageTracker::new();
        tracker.register(id(1), 0);
        tracker.register(id(2), 1);
        tracker.consume(id(1), ReplyOutcome::InternalFailure, Some("disk full"));
        tracker.consume(id(2), ReplyOutcome::WrongDistribution, None);
        assert_eq!(
            tracker.aggregated_status(),
            AggregatedStatus::OwnershipChanged
        );
    }

    #[test]
    fn condition_failure_beats_hard_failure() {
        let mut tracker = PersistenceMessageTracker::new();
        tracker.register(id(1), 0);
        tracker.register(id(2), 1);
        tracker.consume(id(1), ReplyOutcome::TestAndSetFailed, None);
        tracker.consume(id(2), ReplyOutcome::InternalFailure, Some("disk full"));
        assert_eq!(
            tracker.aggregated_status(),
            AggregatedStatus::ConditionFailed
        );
    }

    #[test]
    fn mixed_outcomes_detected() {
        let mut tracker = PersistenceMessageTracker::new();
        tracker.register(id(1), 0);
        tracker.register(id(2), 1);
        tracker.consume(id(1), ReplyOutcome::Ok, None);
        tracker.consume(id(2), ReplyOutcome::Timeout, Some("deadline"));
        assert!(tracker.has_mixed_outcomes());
        assert_eq!(tracker.first_success_node(), Some(0));
        assert_eq!(
            tracker.aggregated_status(),
            AggregatedStatus::Failed {
                message: "deadline".to_string()
            }
        );
    }
}
