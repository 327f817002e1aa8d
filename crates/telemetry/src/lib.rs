//! Internal telemetry for the table backup pipeline.
//!
//! Metrics stay in-process and are periodically logged; there is no
//! external metrics system.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
