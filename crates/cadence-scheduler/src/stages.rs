//! Stage and job lifecycle.
//!
//! Scheduling, rerunning and cancelling stages, job state updates, and the
//! automatic progression that follows a completed stage. Every mutation
//! runs in one [`Transaction`]; progression after a stage completes runs in
//! a second transaction so its failures never undo the first.

use crate::config::SchedulerConfig;
use crate::pause::PauseRegistry;
use crate::transaction::{Transaction, TransactionCoordinator};
use cadence_core::events::{Event, JobStatusChangedPayload, PipelineLockPayload, StageStatusChangedPayload};
use cadence_core::ids::{JobInstanceId, StageInstanceId};
use cadence_core::instance::{JobInstance, JobResult, JobState, PipelineInstance, StageInstance};
use cadence_core::pipeline::{ConfigSnapshot, PipelineConfig, StageConfig};
use cadence_core::ports::ConfigSource;
use cadence_core::{Error, Result};
use cadence_trace::{SchedulingAttributes, stage_span};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{Instrument, debug, error, info};

/// What to create when scheduling a stage.
#[derive(Debug)]
pub(crate) struct StageRequest<'a> {
    pub pipeline: &'a str,
    pub counter: u32,
    pub stage: &'a str,
    pub approved_by: &'a str,
    /// Jobs for a partial rerun; fresh jobs from config when absent.
    pub jobs: Option<Vec<JobInstance>>,
    pub rerun_of: Option<u32>,
}

impl<'a> StageRequest<'a> {
    pub fn new(pipeline: &'a str, counter: u32, stage: &'a str, approved_by: &'a str) -> Self {
        Self {
            pipeline,
            counter,
            stage,
            approved_by,
            jobs: None,
            rerun_of: None,
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<JobInstance>, rerun_of: u32) -> Self {
        self.jobs = Some(jobs);
        self.rerun_of = Some(rerun_of);
        self
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(StageInstance),
    /// The stage had already finished; nothing changed.
    NotActive(StageInstance),
}

impl CancelOutcome {
    pub fn stage(&self) -> &StageInstance {
        match self {
            CancelOutcome::Cancelled(stage) | CancelOutcome::NotActive(stage) => stage,
        }
    }
}

pub(crate) fn stage_event(stage: &StageInstance) -> Event {
    Event::StageStatusChanged(StageStatusChangedPayload {
        stage_id: stage.id,
        stage: stage.identifier(),
        state: stage.state(),
        result: stage.result(),
        approved_by: stage.approved_by.clone(),
        timestamp: Utc::now(),
    })
}

fn job_event(stage: &StageInstance, job: &JobInstance) -> Event {
    Event::JobStatusChanged(JobStatusChangedPayload {
        job_id: job.id,
        stage: stage.identifier(),
        job_name: job.name.clone(),
        state: job.state,
        result: job.result,
        timestamp: Utc::now(),
    })
}

pub(crate) fn lock_event(name: &str, counter: u32) -> PipelineLockPayload {
    PipelineLockPayload {
        pipeline_name: name.to_string(),
        counter,
        timestamp: Utc::now(),
    }
}

pub struct StageService {
    config: Arc<dyn ConfigSource>,
    transactions: Arc<TransactionCoordinator>,
    pauses: Arc<RwLock<PauseRegistry>>,
    settings: SchedulerConfig,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Keyed by `pipeline/counter/stage`.
    reruns: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StageService {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        transactions: Arc<TransactionCoordinator>,
        pauses: Arc<RwLock<PauseRegistry>>,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            config,
            transactions,
            pauses,
            settings,
            guards: Mutex::new(HashMap::new()),
            reruns: Mutex::new(HashMap::new()),
        }
    }

    async fn guard_for(&self, pipeline: &str) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .await
            .entry(pipeline.to_string())
            .or_default()
            .clone()
    }

    /// Wait for other stage operations on `pipeline` to finish.
    pub(crate) async fn serialize(&self, pipeline: &str) -> OwnedMutexGuard<()> {
        self.guard_for(pipeline).await.lock_owned().await
    }

    /// Claim the right to rerun one stage. A second claim fails instead of waiting.
    async fn claim_rerun(&self, pipeline: &str, counter: u32, stage: &str) -> Result<OwnedMutexGuard<()>> {
        let key = format!("{}/{}/{}", pipeline, counter, stage);
        let claim = self.reruns.lock().await.entry(key.clone()).or_default().clone();
        claim.try_lock_owned().map_err(|_| {
            Error::AlreadyInProgress(format!("Another rerun of stage {} is in progress.", key))
        })
    }

    /// Create a new run of a stage inside `tx`.
    pub(crate) async fn schedule_stage_in(
        &self,
        tx: &mut Transaction<'_>,
        config: &ConfigSnapshot,
        request: StageRequest<'_>,
    ) -> Result<StageInstance> {
        let name = request.pipeline;
        let mut instance = tx
            .find_instance(name, request.counter)
            .await?
            .ok_or_else(|| Error::instance_not_found(name, request.counter))?;
        let pipeline_config = config
            .pipeline(name)
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        let stage_config = pipeline_config
            .stage(request.stage)
            .ok_or_else(|| Error::StageNotFound(request.stage.to_string()))?;

        if let Some(active) = instance.active_stage() {
            return Err(Error::AlreadyInProgress(format!(
                "Cannot schedule {} as stage {} of pipeline {} is still in progress.",
                request.stage,
                active.identifier(),
                instance.identifier()
            )));
        }
        check_previous_stage(&instance, pipeline_config, request.stage)?;

        if pipeline_config.is_locked() {
            match tx.lock_holder(name).await {
                Some(holder) if holder != instance.counter => {
                    return Err(Error::Locked(name.to_string()));
                }
                Some(_) => {}
                None => {
                    tx.lock(name, instance.counter);
                    tx.publish(Event::PipelineLocked(lock_event(name, instance.counter)));
                }
            }
        }

        let order = match instance.stage_position(request.stage) {
            Some(position) => position,
            None => {
                instance.stage_order.push(request.stage.to_string());
                instance.stage_order.len() as u32
            }
        };
        let counter = instance.next_stage_counter(request.stage);
        let identifier = instance.identifier();
        let mut stage = StageInstance::schedule(&identifier, stage_config, order, counter, request.approved_by);
        if let Some(jobs) = request.jobs {
            stage.jobs = jobs;
        }
        stage.rerun_of_counter = request.rerun_of;

        info!(
            pipeline = name,
            counter = instance.counter,
            stage = %stage.name,
            stage_counter = stage.counter,
            approved_by = request.approved_by,
            "Scheduling stage"
        );
        tx.publish(stage_event(&stage));
        instance.stages.push(stage.clone());
        tx.stage(instance);
        Ok(stage)
    }

    /// Schedule a new run of `stage` in an existing instance.
    pub async fn rerun_stage(&self, pipeline: &str, counter: u32, stage: &str, user: &str) -> Result<StageInstance> {
        let attrs = SchedulingAttributes::new()
            .pipeline(pipeline)
            .counter(counter)
            .triggered_by(user);
        async {
            let _claim = self.claim_rerun(pipeline, counter, stage).await?;
            let _guard = self.serialize(pipeline).await;
            let config = self.config.current_config().await?;
            let mut tx = self.transactions.begin();
            let scheduled = self
                .schedule_stage_in(&mut tx, &config, StageRequest::new(pipeline, counter, stage, user))
                .await?;
            tx.commit().await?;
            Ok::<_, Error>(scheduled)
        }
        .instrument(stage_span(&attrs, "rerun_stage"))
        .await
    }

    /// Rerun only the named jobs of a completed stage.
    ///
    /// Every other configured job is copied from the source stage with its
    /// result intact.
    pub async fn rerun_jobs(&self, stage_id: StageInstanceId, job_names: &[String], user: &str) -> Result<StageInstance> {
        if job_names.is_empty() {
            return Err(Error::InvalidRequest("No job was selected to re-run.".to_string()));
        }
        let owner = self.owner_of_stage(stage_id).await?;
        let stage_name = owner
            .stage_by_id(stage_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        let _claim = self.claim_rerun(&owner.name, owner.counter, &stage_name).await?;
        let _guard = self.serialize(&owner.name).await;
        let config = self.config.current_config().await?;

        let mut tx = self.transactions.begin();
        let instance = tx
            .find_instance_by_stage(stage_id)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        let source = instance
            .stage_by_id(stage_id)
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        let stage_config = config
            .pipeline(&instance.name)
            .and_then(|p| p.stage(&source.name))
            .ok_or_else(|| Error::StageNotFound(source.name.clone()))?;

        if let Some(missing) = job_names.iter().find(|name| stage_config.job(name).is_none()) {
            return Err(Error::JobNotFound(missing.clone()));
        }
        let jobs = stage_config
            .jobs
            .iter()
            .map(|job| {
                if job_names.contains(&job.name) {
                    return JobInstance::rerun(&job.name);
                }
                match source.job(&job.name) {
                    Some(previous) => JobInstance::copy_of(previous),
                    None => JobInstance::rerun(&job.name),
                }
            })
            .collect();

        let request = StageRequest::new(&instance.name, instance.counter, &source.name, user)
            .with_jobs(jobs, source.counter);
        let scheduled = self.schedule_stage_in(&mut tx, &config, request).await?;
        tx.commit().await?;
        debug!(stage = %scheduled.identifier(), jobs = ?job_names, "Rerunning jobs");
        Ok(scheduled)
    }

    /// Rerun the failed and cancelled jobs of a stage.
    pub async fn rerun_failed_jobs(&self, stage_id: StageInstanceId, user: &str) -> Result<StageInstance> {
        let owner = self.owner_of_stage(stage_id).await?;
        let stage = owner
            .stage_by_id(stage_id)
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        let failed: Vec<String> = stage
            .current_jobs()
            .filter(|j| matches!(j.result, JobResult::Failed | JobResult::Cancelled))
            .map(|j| j.name.clone())
            .collect();
        if failed.is_empty() {
            return Err(Error::InvalidRequest(
                "There are no failed jobs in the stage that could be re-run".to_string(),
            ));
        }
        self.rerun_jobs(stage_id, &failed, user).await
    }

    /// Cancel every unfinished job of a stage, then let progression run.
    pub async fn cancel_stage(&self, stage_id: StageInstanceId, user: &str) -> Result<CancelOutcome> {
        let owner = self.owner_of_stage(stage_id).await?;
        let _guard = self.serialize(&owner.name).await;
        let config = self.config.current_config().await?;

        let mut tx = self.transactions.begin();
        let mut instance = tx
            .find_instance_by_stage(stage_id)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        let stage = instance
            .stage_by_id_mut(stage_id)
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))?;
        if !stage.is_active() {
            return Ok(CancelOutcome::NotActive(stage.clone()));
        }

        let active_jobs: Vec<JobInstanceId> = stage.jobs.iter().filter(|j| j.is_active()).map(|j| j.id).collect();
        stage.cancel();
        let cancelled = stage.clone();
        for job in cancelled.jobs.iter().filter(|j| active_jobs.contains(&j.id)) {
            tx.publish(job_event(&cancelled, job));
        }
        tx.publish(stage_event(&cancelled));
        self.unlock_if_necessary(&mut tx, config.pipeline(&instance.name), &instance, &cancelled)
            .await;
        tx.stage(instance);
        tx.commit().await?;
        info!(stage = %cancelled.identifier(), cancelled_by = user, "Stage cancelled");

        self.progress_after(&config, &cancelled).await;
        Ok(CancelOutcome::Cancelled(cancelled))
    }

    /// Move a job forward. Updates to rescheduled or cancelled jobs are ignored.
    pub async fn update_job_state(&self, job_id: JobInstanceId, state: JobState) -> Result<JobInstance> {
        let owner = self.owner_of_job(job_id).await?;
        let _guard = self.serialize(&owner.name).await;

        let mut tx = self.transactions.begin();
        let mut instance = tx
            .find_instance_by_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let stage = instance
            .stage_with_job_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let before = stage.state();
        let job = stage
            .job_by_id_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if job.is_rescheduled() || job.result == JobResult::Cancelled {
            debug!(job = %job.name, state = %job.state, "Ignoring update for finished job");
            return Ok(job.clone());
        }
        job.transition_to(state)?;
        let updated = job.clone();

        let snapshot = stage.clone();
        tx.publish(job_event(&snapshot, &updated));
        if snapshot.state() != before {
            tx.publish(stage_event(&snapshot));
        }
        tx.stage(instance);
        tx.commit().await?;
        Ok(updated)
    }

    /// Record a job's result. Completing the last job completes the stage.
    pub async fn complete_job(&self, job_id: JobInstanceId, result: JobResult) -> Result<JobInstance> {
        let owner = self.owner_of_job(job_id).await?;
        let _guard = self.serialize(&owner.name).await;
        let config = self.config.current_config().await?;

        let mut tx = self.transactions.begin();
        let mut instance = tx
            .find_instance_by_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let stage = instance
            .stage_with_job_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let job = stage
            .job_by_id_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if job.is_rescheduled() || job.result == JobResult::Cancelled {
            debug!(job = %job.name, "Ignoring completion of finished job");
            return Ok(job.clone());
        }
        job.complete(result)?;
        let completed = job.clone();
        stage.refresh_completion();

        let snapshot = stage.clone();
        tx.publish(job_event(&snapshot, &completed));
        if snapshot.is_completed() {
            tx.publish(stage_event(&snapshot));
            self.unlock_if_necessary(&mut tx, config.pipeline(&instance.name), &instance, &snapshot)
                .await;
        }
        tx.stage(instance);
        tx.commit().await?;

        if snapshot.is_completed() {
            info!(stage = %snapshot.identifier(), result = %snapshot.result(), "Stage completed");
            self.progress_after(&config, &snapshot).await;
        }
        Ok(completed)
    }

    /// Replace an unfinished job with a fresh scheduled copy.
    ///
    /// Returns `None` when the job had already finished.
    pub async fn reschedule_job(&self, job_id: JobInstanceId) -> Result<Option<JobInstance>> {
        let owner = self.owner_of_job(job_id).await?;
        let _guard = self.serialize(&owner.name).await;

        let mut tx = self.transactions.begin();
        let mut instance = tx
            .find_instance_by_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let stage = instance
            .stage_with_job_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let job = stage
            .job_by_id_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if job.is_completed() || job.is_rescheduled() {
            return Ok(None);
        }
        job.transition_to(JobState::Rescheduled)?;
        let old = job.clone();
        let fresh = JobInstance {
            rerun: old.rerun,
            ..JobInstance::scheduled(&old.name)
        };
        stage.jobs.push(fresh.clone());

        let snapshot = stage.clone();
        tx.publish(job_event(&snapshot, &old));
        tx.publish(job_event(&snapshot, &fresh));
        tx.stage(instance);
        tx.commit().await?;
        info!(old = %old.id, new = %fresh.id, job = %fresh.name, "Job rescheduled");
        Ok(Some(fresh))
    }

    async fn owner_of_stage(&self, stage_id: StageInstanceId) -> Result<PipelineInstance> {
        self.transactions
            .repository()
            .find_instance_by_stage(stage_id)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))
    }

    async fn owner_of_job(&self, job_id: JobInstanceId) -> Result<PipelineInstance> {
        self.transactions
            .repository()
            .find_instance_by_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Release the pipeline lock once `stage` finishes the instance's run.
    async fn unlock_if_necessary(
        &self,
        tx: &mut Transaction<'_>,
        config: Option<&PipelineConfig>,
        instance: &PipelineInstance,
        stage: &StageInstance,
    ) {
        if tx.lock_holder(&instance.name).await != Some(instance.counter) {
            return;
        }
        let next = instance.next_stage_name(&stage.name);
        let next_is_manual = next
            .and_then(|n| config.and_then(|c| c.stage(n)))
            .is_some_and(StageConfig::requires_approval);
        let finished = stage.is_completed() && (!stage.passed() || next_is_manual);
        let unlockable = config.is_some_and(PipelineConfig::is_unlockable_when_finished);

        if next.is_none() || (unlockable && finished) {
            tx.unlock(&instance.name);
            tx.publish(Event::PipelineUnlocked(lock_event(&instance.name, instance.counter)));
        }
    }

    /// Progression after `completed` finished. Failures are logged only.
    async fn progress_after(&self, config: &ConfigSnapshot, completed: &StageInstance) {
        if let Err(e) = self.trigger_relevant_stages(config, completed).await {
            error!(
                stage = %completed.identifier(),
                error = %e,
                "Failed to trigger stages following completion"
            );
        }
    }

    async fn trigger_relevant_stages(&self, config: &ConfigSnapshot, completed: &StageInstance) -> Result<()> {
        let name = &completed.pipeline_name;
        if self.pauses.read().await.is_paused(name) {
            debug!(pipeline = %name, "Pipeline paused, not triggering further stages");
            return Ok(());
        }
        let Some(pipeline_config) = config.pipeline(name) else {
            return Ok(());
        };

        let auto_approved = pipeline_config
            .stage(&completed.name)
            .is_some_and(|s| !s.requires_approval());
        if self.settings.trigger_newer_on_completion
            && auto_approved
            && !pipeline_config.is_first_stage(&completed.name)
        {
            self.trigger_in_newer_instance(config, pipeline_config, completed).await?;
        }

        if completed.passed() {
            let instance = self
                .transactions
                .repository()
                .find_instance(name, completed.pipeline_counter)
                .await?
                .ok_or_else(|| Error::instance_not_found(name, completed.pipeline_counter))?;
            self.trigger_next_stage(config, &instance, &completed.name).await?;
        }
        Ok(())
    }

    /// Run `completed`'s stage in a newer instance whose previous stage
    /// passed after this one started.
    async fn trigger_in_newer_instance(
        &self,
        config: &ConfigSnapshot,
        pipeline_config: &PipelineConfig,
        completed: &StageInstance,
    ) -> Result<()> {
        let Some(previous) = pipeline_config.previous_stage(&completed.name) else {
            return Ok(());
        };
        let instances = self
            .transactions
            .repository()
            .list_instances(&completed.pipeline_name)
            .await?;
        let Some(candidate) = instances
            .iter()
            .rev()
            .find(|i| i.latest_stage(&previous.name).is_some_and(StageInstance::passed))
        else {
            return Ok(());
        };
        if candidate.counter <= completed.pipeline_counter
            || candidate.has_stage_been_run(&completed.name)
            || candidate.any_active()
        {
            return Ok(());
        }
        debug!(
            pipeline = %candidate.name,
            counter = candidate.counter,
            stage = %completed.name,
            "Triggering stage in newer instance"
        );
        self.trigger_next_stage(config, candidate, &previous.name).await
    }

    /// Schedule the stage recorded after `after` on this instance.
    async fn trigger_next_stage(&self, config: &ConfigSnapshot, instance: &PipelineInstance, after: &str) -> Result<()> {
        let Some(next) = instance.next_stage_name(after) else {
            return Ok(());
        };
        let Some(next_config) = config.pipeline(&instance.name).and_then(|p| p.stage(next)) else {
            debug!(pipeline = %instance.name, stage = next, "Next stage no longer configured");
            return Ok(());
        };
        if next_config.requires_approval() {
            debug!(pipeline = %instance.name, stage = next, "Next stage awaits manual approval");
            return Ok(());
        }
        if self.is_stage_active_anywhere(&instance.name, next).await? {
            debug!(pipeline = %instance.name, stage = next, "Stage already active in another instance");
            return Ok(());
        }

        let mut tx = self.transactions.begin();
        let request = StageRequest::new(&instance.name, instance.counter, next, &self.settings.default_approver);
        self.schedule_stage_in(&mut tx, config, request).await?;
        tx.commit().await
    }

    async fn is_stage_active_anywhere(&self, pipeline: &str, stage: &str) -> Result<bool> {
        Ok(self
            .transactions
            .repository()
            .list_instances(pipeline)
            .await?
            .iter()
            .any(|i| i.latest_stage(stage).is_some_and(StageInstance::is_active)))
    }
}

/// Refuse a stage whose predecessor never ran or did not pass.
///
/// The predecessor comes from the order recorded on the instance; stages
/// added to config after the instance was created fall back to config order.
fn check_previous_stage(instance: &PipelineInstance, config: &PipelineConfig, stage: &str) -> Result<()> {
    let previous = match instance.stage_position(stage) {
        Some(_) => instance.previous_stage_name(stage).map(str::to_string),
        None => config.previous_stage(stage).map(|s| s.name.clone()),
    };
    let Some(previous) = previous else {
        return Ok(());
    };
    match instance.latest_stage(&previous) {
        None => Err(Error::PreviousStageNotRan {
            stage: stage.to_string(),
            previous,
        }),
        Some(run) if !run.passed() => Err(Error::PreviousStageNotPassed {
            stage: stage.to_string(),
            previous,
            state: run.result().to_string(),
        }),
        Some(_) => Ok(()),
    }
}
