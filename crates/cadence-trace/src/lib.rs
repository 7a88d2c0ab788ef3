//! Logging for Cadence.
//!
//! Installs the process-wide `tracing` subscriber and provides spans that
//! carry pipeline and stage identity through scheduling work.

pub mod logging;
pub mod spans;

pub use logging::{LogFormat, LoggingConfig, TraceError, init_logging};
pub use spans::{SchedulingAttributes, drain_span, pipeline_span, resolve_span, stage_span};
