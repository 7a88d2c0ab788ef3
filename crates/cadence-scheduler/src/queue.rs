//! Pending build causes, at most one per pipeline.

use cadence_core::build_cause::BuildCause;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Schedule queue.
///
/// Holds the cause each pipeline should be built with next, and the cause
/// its last instance was actually created from.
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    pending: BTreeMap<String, BuildCause>,
    most_recent: HashMap<String, BuildCause>,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the pending cause for `name`.
    ///
    /// Returns false when a pending forced cause was kept instead.
    pub fn schedule(&mut self, name: &str, cause: BuildCause) -> bool {
        if let Some(pending) = self.pending.get(name)
            && !cause.trumps(pending)
        {
            debug!(pipeline = name, "Pending forced build cause kept over automatic cause");
            return false;
        }
        debug!(pipeline = name, forced = cause.forced, "Build cause queued");
        self.pending.insert(name.to_string(), cause);
        true
    }

    pub fn pending(&self, name: &str) -> Option<&BuildCause> {
        self.pending.get(name)
    }

    /// Remove and return every pending entry, ordered by pipeline name.
    pub fn take_pending(&mut self) -> Vec<(String, BuildCause)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn most_recent_scheduled(&self, name: &str) -> Option<&BuildCause> {
        self.most_recent.get(name)
    }

    /// Record that `used` created an instance for `name`.
    ///
    /// The pending entry is dropped only while it is still the cause that
    /// was scheduled; a newer cause queued meanwhile survives.
    pub fn finish_schedule(&mut self, name: &str, scheduled: &BuildCause, used: BuildCause) {
        if self.pending.get(name) == Some(scheduled) {
            self.pending.remove(name);
        }
        self.most_recent.insert(name.to_string(), used);
    }

    pub fn cancel_schedule(&mut self, name: &str) -> Option<BuildCause> {
        self.pending.remove(name)
    }

    /// Forget everything about a pipeline that left the config.
    pub fn clear_pipeline(&mut self, name: &str) {
        self.pending.remove(name);
        self.most_recent.remove(name);
    }

    pub fn has_build_cause(&self, name: &str) -> bool {
        self.pending.get(name).is_some_and(BuildCause::has_changes)
    }

    pub fn has_forced_build_cause(&self, name: &str) -> bool {
        self.pending.get(name).is_some_and(BuildCause::is_forced)
    }

    /// An automatic cause identical to the last scheduled one.
    pub fn is_redundant(&self, name: &str, cause: &BuildCause) -> bool {
        !cause.forced
            && self
                .most_recent
                .get(name)
                .is_some_and(|recent| recent.is_same_as(cause))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
