//! Reply composition.
//!
//! The builder accumulates trace fragments and observed timestamps over the
//! operation's lifetime and composes the single outward-facing reply. It
//! enforces reply-once: the first `finish` wins, every later call returns
//! `None`.

use crate::api::update::{UpdateReply, UpdateStatus};
use crate::core::timestamp::Timestamp;
use crate::core::trace::Trace;
use std::time::Instant;

/// Accumulates reply state for one operation.
#[derive(Debug)]
pub struct ReplyBuilder {
    started_at: Instant,
    trace: Trace,
    max_observed_timestamp: Timestamp,
    sent: bool,
}

impl ReplyBuilder {
    /// Builder seeded with the client's trace.
    pub fn new(client_trace: Trace) -> Self {
        Self {
            started_at: Instant::now(),
            trace: client_trace,
            max_observed_timestamp: Timestamp::ZERO,
            sent: false,
        }
    }

    /// Milliseconds since the operation began.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Append a coordinator-side trace event.
    pub fn note(&mut self, message: impl Into<String>) {
        let elapsed = self.elapsed_ms();
        self.trace.note(elapsed, message);
    }

    /// Absorb a sub-operation reply's trace fragment.
    pub fn absorb_trace(&mut self, child: Trace) {
        self.trace.absorb(child);
    }

    /// Record a persisted-timestamp observed in a sub-operation reply.
    pub fn observe_timestamp(&mut self, timestamp: Timestamp) {
        self.max_observed_timestamp = self.max_observed_timestamp.max_of(timestamp);
    }

    /// Highest persisted-timestamp observed so far.
    pub fn max_observed_timestamp(&self) -> Timestamp {
        self.max_observed_timestamp
    }

    /// Whether the reply has been composed.
    pub fn reply_sent(&self) -> bool {
        self.sent
    }

    /// Compose the reply, reporting the observed old timestamp.
    ///
    /// Returns `None` if a reply was already composed.
    pub fn finish(&mut self, status: UpdateStatus, message: Option<String>) -> Option<UpdateReply> {
        self.finish_with_timestamp(status, message, self.max_observed_timestamp)
    }

    /// Compose the reply with an explicit old-timestamp.
    pub fn finish_with_timestamp(
        &mut self,
        status: UpdateStatus,
        message: Option<String>,
        old_timestamp: Timestamp,
    ) -> Option<UpdateReply> {
        if self.sent {
            return None;
        }
        self.sent = true;
        let elapsed = self.elapsed_ms();
        self.trace.note(elapsed, format!("reply: {}", status));
        Some(UpdateReply {
            status,
            old_timestamp: old_timestamp.is_set().then_some(old_timestamp),
            message,
            trace: std::mem::take(&mut self.trace),
        })
    }
}
