//! Operations and observability.

pub mod observability;

pub use observability::{MetricsRegistry, UpdateMetrics};
