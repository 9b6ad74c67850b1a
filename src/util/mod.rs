//! Utility types shared across the node.
//!
//! - [`telemetry`] - Tracing subscriber setup

pub mod telemetry;

pub use telemetry::*;
