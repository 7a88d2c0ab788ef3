//! Resolved trigger context for one pipeline run.

use crate::material::MaterialRevisions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildCause {
    pub material_revisions: MaterialRevisions,
    pub approver: String,
    #[serde(default)]
    pub forced: bool,
    /// Environment-variable overrides supplied with a manual trigger.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl BuildCause {
    /// Cause produced by material changes.
    pub fn with_modifications(revisions: MaterialRevisions, approver: impl Into<String>) -> Self {
        Self {
            material_revisions: revisions,
            approver: approver.into(),
            forced: false,
            variables: BTreeMap::new(),
        }
    }

    /// Cause produced by a user forcing a build.
    pub fn manual_forced(revisions: MaterialRevisions, approver: impl Into<String>) -> Self {
        Self {
            material_revisions: revisions,
            approver: approver.into(),
            forced: true,
            variables: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::with_modifications(MaterialRevisions::new(), "")
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn has_changes(&self) -> bool {
        self.material_revisions.has_changed()
    }

    /// Whether this cause should replace `pending` in the schedule queue.
    ///
    /// A forced cause replaces anything; an automatic cause never replaces a
    /// pending forced one.
    pub fn trumps(&self, pending: &BuildCause) -> bool {
        self.forced || !pending.forced
    }

    /// True when both causes point at the same revisions.
    pub fn is_same_as(&self, other: &BuildCause) -> bool {
        self.material_revisions.is_same_as(&other.material_revisions)
    }

    /// Human readable trigger message.
    pub fn message(&self) -> String {
        if self.forced {
            return format!("Forced by {}", self.approver);
        }
        let changed = self
            .material_revisions
            .iter()
            .find(|r| r.changed)
            .or_else(|| self.material_revisions.get(0));
        match changed {
            Some(rev) if rev.material.is_dependency() => format!(
                "triggered by {}",
                rev.latest_revision().unwrap_or_default()
            ),
            Some(rev) => {
                let user = rev
                    .latest_modification()
                    .and_then(|m| m.user.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("modified by {}", user)
            }
            None => String::new(),
        }
    }
}
