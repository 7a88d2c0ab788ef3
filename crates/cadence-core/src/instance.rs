//! Pipeline, stage and job instance types.
//!
//! A [`PipelineInstance`] is one run of a pipeline. Every stage run is kept:
//! a rerun appends a new [`StageInstance`] with a higher counter and never
//! touches the earlier record.

use crate::build_cause::BuildCause;
use crate::ids::{JobInstanceId, PipelineIdentifier, PipelineInstanceId, StageIdentifier, StageInstanceId};
use crate::pipeline::{Approval, StageConfig};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Building,
    Completing,
    Completed,
    /// Superseded by a fresh copy before it finished.
    Rescheduled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Rescheduled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    #[default]
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub name: String,
    pub state: JobState,
    #[serde(default)]
    pub result: JobResult,
    /// Freshly scheduled as part of a partial stage rerun.
    #[serde(default)]
    pub rerun: bool,
    /// Source job this one was copied from on a partial stage rerun.
    #[serde(default)]
    pub original_job_id: Option<JobInstanceId>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn scheduled(name: impl Into<String>) -> Self {
        Self {
            id: JobInstanceId::new(),
            name: name.into(),
            state: JobState::Scheduled,
            result: JobResult::Unknown,
            rerun: false,
            original_job_id: None,
            scheduled_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fresh instance of `name` scheduled by a partial rerun.
    pub fn rerun(name: impl Into<String>) -> Self {
        Self {
            rerun: true,
            ..Self::scheduled(name)
        }
    }

    /// Carries `source`'s outcome into a new stage run.
    pub fn copy_of(source: &JobInstance) -> Self {
        Self {
            id: JobInstanceId::new(),
            name: source.name.clone(),
            state: source.state,
            result: source.result,
            rerun: false,
            original_job_id: Some(source.id),
            scheduled_at: source.scheduled_at,
            completed_at: source.completed_at,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn is_rescheduled(&self) -> bool {
        self.state == JobState::Rescheduled
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_copy(&self) -> bool {
        self.original_job_id.is_some()
    }

    /// Moves the job forward through its lifecycle.
    pub fn transition_to(&mut self, state: JobState) -> Result<()> {
        if self.state.is_terminal() || state == JobState::Completed {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: state.to_string(),
            });
        }
        self.state = state;
        if state.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn complete(&mut self, result: JobResult) -> Result<()> {
        if self.state.is_terminal() || result == JobResult::Unknown {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: result.to_string(),
            });
        }
        self.state = JobState::Completed;
        self.result = result;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Returns false when the job had already finished.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Completed;
        self.result = JobResult::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Scheduled,
    Building,
    Completing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageInstance {
    pub id: StageInstanceId,
    pub pipeline_name: String,
    pub pipeline_counter: u32,
    pub name: String,
    pub counter: u32,
    /// 1-based position in the owning instance's stage order.
    pub order: u32,
    pub approval: Approval,
    pub approved_by: String,
    #[serde(default)]
    pub rerun_of_counter: Option<u32>,
    pub jobs: Vec<JobInstance>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageInstance {
    pub fn schedule(
        pipeline: &PipelineIdentifier,
        config: &StageConfig,
        order: u32,
        counter: u32,
        approved_by: impl Into<String>,
    ) -> Self {
        Self {
            id: StageInstanceId::new(),
            pipeline_name: pipeline.name.clone(),
            pipeline_counter: pipeline.counter,
            name: config.name.clone(),
            counter,
            order,
            approval: config.approval,
            approved_by: approved_by.into(),
            rerun_of_counter: None,
            jobs: config
                .jobs
                .iter()
                .map(|j| JobInstance::scheduled(&j.name))
                .collect(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn identifier(&self) -> StageIdentifier {
        StageIdentifier {
            pipeline_name: self.pipeline_name.clone(),
            pipeline_counter: self.pipeline_counter,
            stage_name: self.name.clone(),
            stage_counter: self.counter,
        }
    }

    /// Jobs that count towards the stage outcome.
    pub fn current_jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.jobs.iter().filter(|j| !j.is_rescheduled())
    }

    pub fn state(&self) -> StageState {
        let jobs: Vec<&JobInstance> = self.current_jobs().collect();
        if jobs.iter().all(|j| j.is_completed()) {
            return StageState::Completed;
        }
        if jobs.iter().all(|j| j.state == JobState::Scheduled) {
            return StageState::Scheduled;
        }
        if jobs
            .iter()
            .all(|j| matches!(j.state, JobState::Completing | JobState::Completed))
        {
            return StageState::Completing;
        }
        StageState::Building
    }

    pub fn result(&self) -> StageResult {
        if self.state() != StageState::Completed {
            return StageResult::Unknown;
        }
        if self.current_jobs().any(|j| j.result == JobResult::Cancelled) {
            StageResult::Cancelled
        } else if self.current_jobs().any(|j| j.result == JobResult::Failed) {
            StageResult::Failed
        } else {
            StageResult::Passed
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() != StageState::Completed
    }

    pub fn is_completed(&self) -> bool {
        !self.is_active()
    }

    pub fn passed(&self) -> bool {
        self.result() == StageResult::Passed
    }

    pub fn requires_approval(&self) -> bool {
        self.approval == Approval::Manual
    }

    pub fn job(&self, name: &str) -> Option<&JobInstance> {
        self.current_jobs().find(|j| j.name == name)
    }

    pub fn job_by_id(&self, id: JobInstanceId) -> Option<&JobInstance> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_by_id_mut(&mut self, id: JobInstanceId) -> Option<&mut JobInstance> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn failed_job_names(&self) -> Vec<String> {
        self.current_jobs()
            .filter(|j| j.result == JobResult::Failed)
            .map(|j| j.name.clone())
            .collect()
    }

    /// Cancels every unfinished job, returning how many changed.
    pub fn cancel(&mut self) -> usize {
        let cancelled = self.jobs.iter_mut().map(JobInstance::cancel).filter(|c| *c).count();
        self.refresh_completion();
        cancelled
    }

    /// Stamps `completed_at` once every job has finished.
    pub fn refresh_completion(&mut self) {
        if self.is_completed() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineInstance {
    pub id: PipelineInstanceId,
    pub name: String,
    pub counter: u32,
    pub label: String,
    pub build_cause: BuildCause,
    /// Stage names in the order configured when this instance was created.
    pub stage_order: Vec<String>,
    #[serde(default)]
    pub stages: Vec<StageInstance>,
    pub created_at: DateTime<Utc>,
}

impl PipelineInstance {
    pub fn new(
        name: impl Into<String>,
        counter: u32,
        label: impl Into<String>,
        build_cause: BuildCause,
        stage_order: Vec<String>,
    ) -> Self {
        Self {
            id: PipelineInstanceId::new(),
            name: name.into(),
            counter,
            label: label.into(),
            build_cause,
            stage_order,
            stages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn identifier(&self) -> PipelineIdentifier {
        PipelineIdentifier::new(&self.name, self.counter, &self.label)
    }

    /// Most recent run of the named stage.
    pub fn latest_stage(&self, name: &str) -> Option<&StageInstance> {
        self.stages
            .iter()
            .filter(|s| s.name == name)
            .max_by_key(|s| s.counter)
    }

    pub fn stage(&self, name: &str, counter: u32) -> Option<&StageInstance> {
        self.stages.iter().find(|s| s.name == name && s.counter == counter)
    }

    pub fn stage_by_id(&self, id: StageInstanceId) -> Option<&StageInstance> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_by_id_mut(&mut self, id: StageInstanceId) -> Option<&mut StageInstance> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    pub fn stage_with_job(&self, job: JobInstanceId) -> Option<&StageInstance> {
        self.stages.iter().find(|s| s.job_by_id(job).is_some())
    }

    pub fn stage_with_job_mut(&mut self, job: JobInstanceId) -> Option<&mut StageInstance> {
        self.stages.iter_mut().find(|s| s.job_by_id(job).is_some())
    }

    pub fn has_stage_been_run(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name == name)
    }

    pub fn next_stage_counter(&self, name: &str) -> u32 {
        self.latest_stage(name).map_or(1, |s| s.counter + 1)
    }

    /// Position of `name` in the recorded stage order, 1-based.
    pub fn stage_position(&self, name: &str) -> Option<u32> {
        self.stage_order
            .iter()
            .position(|s| s == name)
            .map(|i| i as u32 + 1)
    }

    /// Stage that follows `name` in the order recorded on this instance.
    pub fn next_stage_name(&self, name: &str) -> Option<&str> {
        let index = self.stage_order.iter().position(|s| s == name)?;
        self.stage_order.get(index + 1).map(String::as_str)
    }

    pub fn previous_stage_name(&self, name: &str) -> Option<&str> {
        let index = self.stage_order.iter().position(|s| s == name)?;
        index
            .checked_sub(1)
            .and_then(|i| self.stage_order.get(i))
            .map(String::as_str)
    }

    pub fn is_last_stage(&self, name: &str) -> bool {
        self.stage_order.last().is_some_and(|s| s == name)
    }

    /// Whether any stage run of this instance is still in flight.
    pub fn any_active(&self) -> bool {
        self.stages.iter().any(StageInstance::is_active)
    }

    pub fn active_stage(&self) -> Option<&StageInstance> {
        self.stages.iter().find(|s| s.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stage(jobs: &[&str]) -> StageInstance {
        StageInstance::schedule(
            &PipelineIdentifier::new("cruise", 1, "1"),
            &StageConfig::new("dev", jobs),
            1,
            1,
            "changes",
        )
    }

    #[test]
    fn test_stage_state_follows_jobs() {
        let mut stage = stage(&["unit", "lint"]);
        assert_eq!(stage.state(), StageState::Scheduled);

        stage.jobs[0].transition_to(JobState::Building).unwrap();
        assert_eq!(stage.state(), StageState::Building);

        stage.jobs[0].complete(JobResult::Passed).unwrap();
        stage.jobs[1].transition_to(JobState::Completing).unwrap();
        assert_eq!(stage.state(), StageState::Completing);

        stage.jobs[1].complete(JobResult::Failed).unwrap();
        assert_eq!(stage.state(), StageState::Completed);
        assert_eq!(stage.result(), StageResult::Failed);
        assert_eq!(stage.failed_job_names(), vec!["lint".to_string()]);
    }

    #[test]
    fn test_cancel_only_touches_unfinished_jobs() {
        let mut stage = stage(&["unit", "lint"]);
        stage.jobs[0].complete(JobResult::Passed).unwrap();
        assert_eq!(stage.cancel(), 1);
        assert_eq!(stage.jobs[0].result, JobResult::Passed);
        assert_eq!(stage.result(), StageResult::Cancelled);
        assert!(stage.completed_at.is_some());
    }

    #[test]
    fn test_completed_job_rejects_transition() {
        let mut job = JobInstance::scheduled("unit");
        job.complete(JobResult::Passed).unwrap();
        assert!(job.transition_to(JobState::Building).is_err());
        assert!(job.complete(JobResult::Failed).is_err());
        assert!(!job.cancel());
    }

    #[test]
    fn test_rescheduled_jobs_do_not_count() {
        let mut stage = stage(&["unit"]);
        stage.jobs[0].transition_to(JobState::Rescheduled).unwrap();
        let mut fresh = JobInstance::scheduled("unit");
        fresh.complete(JobResult::Passed).unwrap();
        stage.jobs.push(fresh);
        assert!(stage.passed());
    }

    #[test]
    fn test_copy_keeps_outcome() {
        let mut source = JobInstance::scheduled("foo2");
        source.complete(JobResult::Failed).unwrap();
        let copy = JobInstance::copy_of(&source);
        assert_ne!(copy.id, source.id);
        assert_eq!(copy.original_job_id, Some(source.id));
        assert_eq!(copy.result, JobResult::Failed);
        assert!(!copy.rerun);
    }

    #[test]
    fn test_historical_stage_order() {
        let instance = PipelineInstance::new(
            "cruise",
            1,
            "1",
            BuildCause::empty(),
            vec!["dev".to_string(), "ft".to_string()],
        );
        assert_eq!(instance.next_stage_name("dev"), Some("ft"));
        assert_eq!(instance.next_stage_name("ft"), None);
        assert_eq!(instance.previous_stage_name("ft"), Some("dev"));
        assert!(instance.is_last_stage("ft"));
        assert_eq!(instance.stage_position("ft"), Some(2));
    }
}
