//! Domain events published after a scheduling transaction commits.

use crate::ids::*;
use crate::instance::{JobResult, JobState, StageResult, StageState};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events raised by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Pipeline lifecycle
    PipelineScheduled(PipelineScheduledPayload),
    PipelineLocked(PipelineLockPayload),
    PipelineUnlocked(PipelineLockPayload),

    // Stage lifecycle
    StageStatusChanged(StageStatusChangedPayload),

    // Job lifecycle
    JobStatusChanged(JobStatusChangedPayload),
}

impl Event {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::PipelineScheduled(p) => {
                format!("pipeline.scheduled.{}.{}", p.pipeline.name, p.pipeline.counter)
            }
            Event::PipelineLocked(p) => format!("pipeline.locked.{}", p.pipeline_name),
            Event::PipelineUnlocked(p) => format!("pipeline.unlocked.{}", p.pipeline_name),
            Event::StageStatusChanged(p) => format!(
                "pipeline.{}.{}.stage.{}.{}",
                p.stage.pipeline_name, p.stage.pipeline_counter, p.stage.stage_name, p.stage.stage_counter
            ),
            Event::JobStatusChanged(p) => format!(
                "pipeline.{}.{}.stage.{}.{}.job.{}",
                p.stage.pipeline_name,
                p.stage.pipeline_counter,
                p.stage.stage_name,
                p.stage.stage_counter,
                p.job_name
            ),
        }
    }

    /// Name of the pipeline the event belongs to.
    pub fn pipeline_name(&self) -> &str {
        match self {
            Event::PipelineScheduled(p) => &p.pipeline.name,
            Event::PipelineLocked(p) | Event::PipelineUnlocked(p) => &p.pipeline_name,
            Event::StageStatusChanged(p) => &p.stage.pipeline_name,
            Event::JobStatusChanged(p) => &p.stage.pipeline_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineScheduledPayload {
    pub instance_id: PipelineInstanceId,
    pub pipeline: PipelineIdentifier,
    pub approver: String,
    pub forced: bool,
    pub trigger_message: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineLockPayload {
    pub pipeline_name: String,
    pub counter: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageStatusChangedPayload {
    pub stage_id: StageInstanceId,
    pub stage: StageIdentifier,
    pub state: StageState,
    pub result: StageResult,
    pub approved_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusChangedPayload {
    pub job_id: JobInstanceId,
    pub stage: StageIdentifier,
    pub job_name: String,
    pub state: JobState,
    pub result: JobResult,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_id() -> StageIdentifier {
        StageIdentifier {
            pipeline_name: "cruise".to_string(),
            pipeline_counter: 4,
            stage_name: "dev".to_string(),
            stage_counter: 2,
        }
    }

    #[test]
    fn test_subjects() {
        let stage = Event::StageStatusChanged(StageStatusChangedPayload {
            stage_id: StageInstanceId::new(),
            stage: stage_id(),
            state: StageState::Completed,
            result: StageResult::Passed,
            approved_by: "changes".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(stage.subject(), "pipeline.cruise.4.stage.dev.2");
        assert_eq!(stage.pipeline_name(), "cruise");

        let unlocked = Event::PipelineUnlocked(PipelineLockPayload {
            pipeline_name: "cruise".to_string(),
            counter: 4,
            timestamp: Utc::now(),
        });
        assert_eq!(unlocked.subject(), "pipeline.unlocked.cruise");
    }

    #[test]
    fn test_serialized_tag() {
        let event = Event::JobStatusChanged(JobStatusChangedPayload {
            job_id: JobInstanceId::new(),
            stage: stage_id(),
            job_name: "unit".to_string(),
            state: JobState::Building,
            result: JobResult::Unknown,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_status_changed");
        assert_eq!(json["state"], "building");
    }
}
