//! Operation trace accumulation.
//!
//! Each operation carries an append-only trace that collects events from the
//! coordinator itself and from every sub-operation reply. The trace is a flat
//! rope: children are concatenated in arrival order, never restructured, and
//! the final reply carries the whole rope back to the client.

use serde::{Deserialize, Serialize};

/// A single trace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Milliseconds since the operation began.
    pub elapsed_ms: u64,
    /// Human-readable event description.
    pub message: String,
}

/// Append-only trace rope for one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn note(&mut self, elapsed_ms: u64, message: impl Into<String>) {
        self.events.push(TraceEvent {
            elapsed_ms,
            message: message.into(),
        });
    }

    /// Append all events of a child trace, preserving their order.
    ///
    /// Sub-operation replies hand their trace over by value; the rope only
    /// ever grows.
    pub fn absorb(&mut self, child: Trace) {
        self.events.extend(child.events);
    }

    /// Whether any events were recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Iterate over recorded events.
    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    /// Render the trace as indented text for logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&format!("[{:>6}ms] {}\n", event.elapsed_ms, event.message));
        }
        out
    }
}
