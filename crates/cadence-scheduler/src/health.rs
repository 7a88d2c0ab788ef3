//! Server health messages raised by scheduling.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// What a health message is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "scope", content = "target", rename_all = "snake_case")]
pub enum HealthScope {
    Global,
    Pipeline(String),
    Stage(String, String),
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthScope::Global => write!(f, "global"),
            HealthScope::Pipeline(name) => write!(f, "pipeline {}", name),
            HealthScope::Stage(pipeline, stage) => write!(f, "stage {}/{}", pipeline, stage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub level: HealthLevel,
    pub message: String,
    pub description: String,
}

impl HealthState {
    pub fn error(message: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Error,
            message: message.into(),
            description: description.into(),
        }
    }

    pub fn warning(message: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: HealthLevel::Warning,
            message: message.into(),
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == HealthLevel::Error
    }
}

/// Latest health state per scope.
#[derive(Debug, Default)]
pub struct ServerHealth {
    states: BTreeMap<HealthScope, HealthState>,
}

impl ServerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, scope: HealthScope, state: HealthState) {
        self.states.insert(scope, state);
    }

    pub fn clear(&mut self, scope: &HealthScope) -> Option<HealthState> {
        self.states.remove(scope)
    }

    pub fn get(&self, scope: &HealthScope) -> Option<&HealthState> {
        self.states.get(scope)
    }

    pub fn all(&self) -> Vec<(HealthScope, HealthState)> {
        self.states
            .iter()
            .map(|(scope, state)| (scope.clone(), state.clone()))
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        !self.states.values().any(HealthState::is_error)
    }
}
