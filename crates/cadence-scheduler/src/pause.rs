//! Paused pipelines.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseInfo {
    pub paused_by: String,
    pub reason: String,
    pub paused_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PauseRegistry {
    paused: HashMap<String, PauseInfo>,
}

impl PauseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the pipeline was already paused.
    pub fn pause(&mut self, name: &str, by: impl Into<String>, reason: impl Into<String>) -> bool {
        if self.paused.contains_key(name) {
            return false;
        }
        self.paused.insert(
            name.to_string(),
            PauseInfo {
                paused_by: by.into(),
                reason: reason.into(),
                paused_at: Utc::now(),
            },
        );
        true
    }

    pub fn unpause(&mut self, name: &str) -> bool {
        self.paused.remove(name).is_some()
    }

    pub fn is_paused(&self, name: &str) -> bool {
        self.paused.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<&PauseInfo> {
        self.paused.get(name)
    }
}
