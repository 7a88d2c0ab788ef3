//! Span creation for scheduling operations.

use tracing::{Level, Span, span};

/// Identity attached to scheduling spans.
#[derive(Debug, Default, Clone)]
pub struct SchedulingAttributes {
    pub pipeline_name: Option<String>,
    pub pipeline_counter: Option<u32>,
    pub stage_name: Option<String>,
    pub stage_counter: Option<u32>,
    pub triggered_by: Option<String>,
}

impl SchedulingAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn counter(mut self, counter: u32) -> Self {
        self.pipeline_counter = Some(counter);
        self
    }

    pub fn stage(mut self, name: impl Into<String>, counter: u32) -> Self {
        self.stage_name = Some(name.into());
        self.stage_counter = Some(counter);
        self
    }

    pub fn triggered_by(mut self, user: impl Into<String>) -> Self {
        self.triggered_by = Some(user.into());
        self
    }
}

/// Span for work on one pipeline.
pub fn pipeline_span(attrs: &SchedulingAttributes, operation: &str) -> Span {
    span!(
        Level::INFO,
        "pipeline.operation",
        operation = operation,
        pipeline = attrs.pipeline_name.as_deref().unwrap_or(""),
        counter = attrs.pipeline_counter.unwrap_or(0),
        triggered_by = attrs.triggered_by.as_deref().unwrap_or(""),
    )
}

/// Span for work on one stage run.
pub fn stage_span(attrs: &SchedulingAttributes, operation: &str) -> Span {
    span!(
        Level::INFO,
        "stage.operation",
        operation = operation,
        pipeline = attrs.pipeline_name.as_deref().unwrap_or(""),
        counter = attrs.pipeline_counter.unwrap_or(0),
        stage = attrs.stage_name.as_deref().unwrap_or(""),
        stage_counter = attrs.stage_counter.unwrap_or(0),
    )
}

/// Span for one fan-in resolution.
pub fn resolve_span(pipeline: &str) -> Span {
    span!(Level::DEBUG, "fanin.resolve", pipeline = pipeline)
}

/// Span for one schedule queue drain pass.
pub fn drain_span(pending: usize) -> Span {
    span!(Level::INFO, "queue.drain", pending = pending)
}
