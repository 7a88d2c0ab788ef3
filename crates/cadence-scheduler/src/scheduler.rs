//! Scheduling service facade.

use crate::config::SchedulerConfig;
use crate::health::{HealthScope, HealthState, ServerHealth};
use crate::lock::LockTable;
use crate::pause::{PauseInfo, PauseRegistry};
use crate::producer::BuildCauseProducer;
use crate::queue::ScheduleQueue;
use crate::stages::{CancelOutcome, StageRequest, StageService, lock_event};
use crate::transaction::{ListenerRegistry, TransactionCoordinator};
use crate::vsm::{ValueStreamMap, ValueStreamMapRenderer};

use cadence_core::build_cause::BuildCause;
use cadence_core::events::{Event, PipelineScheduledPayload};
use cadence_core::ids::{JobInstanceId, PipelineIdentifier, StageInstanceId};
use cadence_core::instance::{JobInstance, JobResult, JobState, PipelineInstance, StageInstance};
use cadence_core::label::render_label;
use cadence_core::material::Fingerprint;
use cadence_core::operation::{OperationResult, StatusCategory};
use cadence_core::pipeline::ConfigSnapshot;
use cadence_core::ports::{
    ConfigSource, DiskSpaceProbe, EventListener, MaterialPoller, PermissionChecker, PipelineRepository,
};
use cadence_core::{Error, Result};
use cadence_trace::{SchedulingAttributes, drain_span, pipeline_span};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info, warn};

/// Adapters the scheduler runs against.
#[derive(Clone)]
pub struct SchedulerPorts {
    pub config: Arc<dyn ConfigSource>,
    pub repo: Arc<dyn PipelineRepository>,
    pub poller: Arc<dyn MaterialPoller>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub disk: Arc<dyn DiskSpaceProbe>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub scheduled: Vec<PipelineIdentifier>,
    /// Pipeline name and the reason its entry was dropped.
    pub failed: Vec<(String, String)>,
    /// Automatic causes identical to the last scheduled one.
    pub discarded: Vec<String>,
}

/// The scheduling service.
pub struct ScheduleService {
    ports: SchedulerPorts,
    settings: SchedulerConfig,
    queue: Arc<RwLock<ScheduleQueue>>,
    locks: Arc<RwLock<LockTable>>,
    pauses: Arc<RwLock<PauseRegistry>>,
    health: Arc<RwLock<ServerHealth>>,
    transactions: Arc<TransactionCoordinator>,
    stages: StageService,
    producer: BuildCauseProducer,
    renderer: ValueStreamMapRenderer,
}

impl ScheduleService {
    pub fn new(ports: SchedulerPorts, settings: SchedulerConfig) -> Self {
        let locks = Arc::new(RwLock::new(LockTable::new()));
        let pauses = Arc::new(RwLock::new(PauseRegistry::new()));
        let transactions = Arc::new(TransactionCoordinator::new(
            ports.repo.clone(),
            locks.clone(),
            Arc::new(ListenerRegistry::new()),
        ));
        let stages = StageService::new(
            ports.config.clone(),
            transactions.clone(),
            pauses.clone(),
            settings.clone(),
        );
        let producer = BuildCauseProducer::new(ports.poller.clone(), ports.repo.clone());
        let renderer = ValueStreamMapRenderer::new(
            ports.config.clone(),
            ports.repo.clone(),
            ports.permissions.clone(),
        );

        Self {
            ports,
            settings,
            queue: Arc::new(RwLock::new(ScheduleQueue::new())),
            locks,
            pauses,
            health: Arc::new(RwLock::new(ServerHealth::new())),
            transactions,
            stages,
            producer,
            renderer,
        }
    }

    pub fn settings(&self) -> &SchedulerConfig {
        &self.settings
    }

    pub fn producer(&self) -> &BuildCauseProducer {
        &self.producer
    }

    /// Receive events after every committed scheduling transaction.
    pub async fn register_listener(&self, listener: Arc<dyn EventListener>) {
        self.transactions.listeners().register(listener).await;
    }

    async fn check_operate(&self, user: &str, pipeline: &str) -> Result<()> {
        if self.ports.permissions.can_operate(user, pipeline).await {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "You do not have operate permissions for pipeline '{}'.",
                pipeline
            )))
        }
    }

    // ---- Queue ----

    /// Queue an automatic cause. Returns false if a pending forced cause won.
    pub async fn schedule(&self, name: &str, cause: BuildCause) -> bool {
        self.queue.write().await.schedule(name, cause)
    }

    pub async fn pending_cause(&self, name: &str) -> Option<BuildCause> {
        self.queue.read().await.pending(name).cloned()
    }

    /// Force a build of `name` with optional pegged revisions and variables.
    pub async fn schedule_manual(
        &self,
        name: &str,
        user: &str,
        overrides: &BTreeMap<Fingerprint, String>,
        variables: BTreeMap<String, String>,
    ) -> OperationResult<()> {
        let attrs = SchedulingAttributes::new().pipeline(name).triggered_by(user);
        let outcome = self
            .queue_manual_cause(name, user, overrides, variables)
            .instrument(pipeline_span(&attrs, "schedule_manual"))
            .await;
        match outcome {
            Ok(()) => OperationResult::accepted(format!("Request to schedule pipeline {} accepted", name), None),
            Err(e) => {
                debug!(pipeline = name, error = %e, "Manual schedule refused");
                OperationResult::from_error(&e)
            }
        }
    }

    async fn queue_manual_cause(
        &self,
        name: &str,
        user: &str,
        overrides: &BTreeMap<Fingerprint, String>,
        variables: BTreeMap<String, String>,
    ) -> Result<()> {
        let config = self.ports.config.current_config().await?;
        let pipeline = config
            .pipeline(name)
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        self.check_operate(user, name).await?;
        if self.pauses.read().await.is_paused(name) {
            return Err(Error::Paused(name.to_string()));
        }
        if self.locks.read().await.is_locked(name) {
            return Err(Error::Locked(name.to_string()));
        }
        if self.queue.read().await.has_forced_build_cause(name) {
            return Err(Error::AlreadyInProgress(format!(
                "Failed to force pipeline '{}'. Pipeline already forced.",
                name
            )));
        }

        let cause = self
            .producer
            .manual_build_cause(&config, pipeline, user, overrides, variables)
            .await?;
        self.queue.write().await.schedule(name, cause);
        info!(pipeline = name, triggered_by = user, "Manual build queued");
        Ok(())
    }

    /// Poll every auto-triggered pipeline and queue the ones that changed.
    ///
    /// Returns the names that were queued.
    pub async fn trigger_changed_pipelines(&self) -> Vec<String> {
        let config = match self.ports.config.current_config().await {
            Ok(config) => config,
            Err(e) => {
                self.record_global_failure(&e).await;
                return Vec::new();
            }
        };

        let mut queued = Vec::new();
        for pipeline in config.iter() {
            let name = pipeline.name.as_str();
            if pipeline.first_stage().is_none_or(|s| s.requires_approval()) {
                continue;
            }
            if self.pauses.read().await.is_paused(name) {
                continue;
            }
            match self
                .producer
                .auto_build_cause(&config, pipeline, &self.settings.default_approver)
                .await
            {
                Ok(Some(cause)) => {
                    if self.queue.write().await.schedule(name, cause) {
                        queued.push(pipeline.name.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pipeline = name, error = %e, "Failed to produce build cause");
                    self.health.write().await.update(
                        HealthScope::Pipeline(pipeline.name.clone()),
                        HealthState::error(format!("Failed to check materials of pipeline '{}'", name), e.to_string()),
                    );
                }
            }
        }
        queued
    }

    /// Drain the schedule queue once, creating an instance per pending entry.
    ///
    /// A failing entry is dropped and recorded as a health error; it never
    /// stops the rest of the pass.
    pub async fn schedule_auto(&self) -> DrainReport {
        let pending = self.queue.write().await.take_pending();
        let span = drain_span(pending.len());
        self.drain(pending).instrument(span).await
    }

    async fn drain(&self, pending: Vec<(String, BuildCause)>) -> DrainReport {
        let mut report = DrainReport::default();
        if pending.is_empty() {
            return report;
        }
        let config = match self.ports.config.current_config().await {
            Ok(config) => config,
            Err(e) => {
                self.record_global_failure(&e).await;
                let mut queue = self.queue.write().await;
                for (name, cause) in pending {
                    queue.schedule(&name, cause);
                }
                return report;
            }
        };
        self.health.write().await.clear(&HealthScope::Global);

        for (name, cause) in pending {
            if self.queue.read().await.is_redundant(&name, &cause) {
                debug!(pipeline = %name, "Discarding cause identical to the last scheduled one");
                report.discarded.push(name);
                continue;
            }

            match self.create_instance(&config, &name, &cause).await {
                Ok(identifier) => {
                    self.queue.write().await.finish_schedule(&name, &cause, cause.clone());
                    self.health.write().await.clear(&HealthScope::Pipeline(name.clone()));
                    report.scheduled.push(identifier);
                }
                Err(e) => {
                    warn!(pipeline = %name, error = %e, "Failed to schedule pipeline");
                    if matches!(e, Error::PipelineNotFound(_)) {
                        self.queue.write().await.clear_pipeline(&name);
                    }
                    self.health.write().await.update(
                        HealthScope::Pipeline(name.clone()),
                        HealthState::error(format!("Failed to schedule pipeline '{}'", name), e.to_string()),
                    );
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    async fn create_instance(
        &self,
        config: &ConfigSnapshot,
        name: &str,
        cause: &BuildCause,
    ) -> Result<PipelineIdentifier> {
        let pipeline = config
            .pipeline(name)
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        let first = pipeline
            .first_stage()
            .ok_or_else(|| Error::InvalidRequest(format!("Pipeline '{}' has no stages.", name)))?;
        if self.pauses.read().await.is_paused(name) {
            return Err(Error::Paused(name.to_string()));
        }
        let available_mb = self.ports.disk.available_mb().await?;
        if available_mb < self.settings.min_free_disk_mb {
            return Err(Error::DiskFull {
                required_mb: self.settings.min_free_disk_mb,
                available_mb,
            });
        }

        let _guard = self.stages.serialize(name).await;
        let mut tx = self.transactions.begin();
        if tx.is_locked(name).await {
            return Err(Error::Locked(name.to_string()));
        }
        let counter = tx.most_recent(name).await?.map_or(1, |i| i.counter + 1);
        let label = render_label(&pipeline.label_template, counter, &cause.material_revisions)?;
        let instance = PipelineInstance::new(name, counter, label, cause.clone(), pipeline.stage_names());
        let identifier = instance.identifier();

        tx.publish(Event::PipelineScheduled(PipelineScheduledPayload {
            instance_id: instance.id,
            pipeline: identifier.clone(),
            approver: cause.approver.clone(),
            forced: cause.forced,
            trigger_message: cause.message(),
            scheduled_at: Utc::now(),
        }));
        tx.stage(instance);

        let approver = if cause.forced {
            cause.approver.as_str()
        } else {
            self.settings.default_approver.as_str()
        };
        self.stages
            .schedule_stage_in(&mut tx, config, StageRequest::new(name, counter, &first.name, approver))
            .await?;
        tx.commit().await?;

        info!(pipeline = name, counter, label = %identifier.label, "Pipeline scheduled");
        Ok(identifier)
    }

    async fn record_global_failure(&self, error: &Error) {
        warn!(error = %error, "Could not read pipeline configuration");
        self.health.write().await.update(
            HealthScope::Global,
            HealthState::error("Could not read pipeline configuration", error.to_string()),
        );
    }

    // ---- Stages and jobs ----

    async fn resolve_counter(&self, name: &str, counter_or_label: &str) -> Result<u32> {
        if let Ok(counter) = counter_or_label.parse::<u32>() {
            return Ok(counter);
        }
        self.ports
            .repo
            .find_instance_by_label(name, counter_or_label)
            .await?
            .map(|instance| instance.counter)
            .ok_or_else(|| Error::instance_not_found(name, counter_or_label))
    }

    async fn stage_owner(&self, stage_id: StageInstanceId) -> Result<String> {
        self.ports
            .repo
            .find_instance_by_stage(stage_id)
            .await?
            .map(|instance| instance.name)
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))
    }

    /// Schedule a new run of a stage. `counter_or_label` accepts either.
    pub async fn rerun_stage(
        &self,
        name: &str,
        counter_or_label: &str,
        stage: &str,
        user: &str,
    ) -> OperationResult<StageInstance> {
        let outcome = async {
            self.check_operate(user, name).await?;
            let counter = self.resolve_counter(name, counter_or_label).await?;
            self.stages.rerun_stage(name, counter, stage, user).await
        }
        .await;
        match outcome {
            Ok(scheduled) => OperationResult::accepted(
                format!(
                    "Request to schedule stage {}/{}/{} accepted",
                    name, scheduled.pipeline_counter, scheduled.name
                ),
                Some(scheduled),
            ),
            Err(e) => OperationResult::from_error(&e),
        }
    }

    pub async fn rerun_jobs(
        &self,
        stage_id: StageInstanceId,
        job_names: &[String],
        user: &str,
    ) -> OperationResult<StageInstance> {
        let outcome = async {
            let owner = self.stage_owner(stage_id).await?;
            self.check_operate(user, &owner).await?;
            self.stages.rerun_jobs(stage_id, job_names, user).await
        }
        .await;
        match outcome {
            Ok(scheduled) => OperationResult::accepted("Request to rerun jobs accepted", Some(scheduled)),
            Err(e) => OperationResult::from_error(&e),
        }
    }

    pub async fn rerun_failed_jobs(&self, stage_id: StageInstanceId, user: &str) -> OperationResult<StageInstance> {
        let outcome = async {
            let owner = self.stage_owner(stage_id).await?;
            self.check_operate(user, &owner).await?;
            self.stages.rerun_failed_jobs(stage_id, user).await
        }
        .await;
        match outcome {
            Ok(scheduled) => OperationResult::accepted("Request to rerun jobs accepted", Some(scheduled)),
            Err(e) => OperationResult::from_error(&e),
        }
    }

    pub async fn cancel_stage(&self, stage_id: StageInstanceId, user: &str) -> OperationResult<StageInstance> {
        let outcome = async {
            let owner = self.stage_owner(stage_id).await?;
            self.check_operate(user, &owner).await?;
            self.stages.cancel_stage(stage_id, user).await
        }
        .await;
        match outcome {
            Ok(CancelOutcome::Cancelled(stage)) => OperationResult::ok("Stage cancelled successfully.", stage),
            Ok(CancelOutcome::NotActive(stage)) => {
                OperationResult::ok("Stage is not active. Cancellation Ignored.", stage)
            }
            Err(e) => OperationResult::from_error(&e),
        }
    }

    pub async fn update_job_state(&self, job_id: JobInstanceId, state: JobState) -> Result<JobInstance> {
        self.stages.update_job_state(job_id, state).await
    }

    pub async fn complete_job(&self, job_id: JobInstanceId, result: JobResult) -> Result<JobInstance> {
        self.stages.complete_job(job_id, result).await
    }

    pub async fn reschedule_job(&self, job_id: JobInstanceId) -> Result<Option<JobInstance>> {
        self.stages.reschedule_job(job_id).await
    }

    // ---- Value stream map ----

    pub async fn get_value_stream_graph(
        &self,
        name: &str,
        counter: u32,
        user: &str,
    ) -> OperationResult<ValueStreamMap> {
        match self.renderer.render(name, counter, user).await {
            Ok(map) => OperationResult::ok(format!("Value stream map of {}/{}", name, counter), map),
            Err(e) => OperationResult::from_error(&e),
        }
    }

    // ---- Pause, lock and health ----

    pub async fn pause(&self, name: &str, user: &str, reason: &str) -> OperationResult<()> {
        if let Err(e) = self.check_known_and_operable(name, user).await {
            return OperationResult::from_error(&e);
        }
        if self.pauses.write().await.pause(name, user, reason) {
            info!(pipeline = name, paused_by = user, reason, "Pipeline paused");
            OperationResult::ok_empty(format!("Pipeline '{}' paused successfully.", name))
        } else {
            OperationResult::failure(
                StatusCategory::Conflict,
                format!("Failed to pause pipeline '{}'. Pipeline '{}' is already paused.", name, name),
            )
        }
    }

    pub async fn unpause(&self, name: &str, user: &str) -> OperationResult<()> {
        if let Err(e) = self.check_known_and_operable(name, user).await {
            return OperationResult::from_error(&e);
        }
        if self.pauses.write().await.unpause(name) {
            info!(pipeline = name, unpaused_by = user, "Pipeline unpaused");
            OperationResult::ok_empty(format!("Pipeline '{}' unpaused successfully.", name))
        } else {
            OperationResult::failure(
                StatusCategory::Conflict,
                format!("Failed to unpause pipeline '{}'. Pipeline '{}' is not paused.", name, name),
            )
        }
    }

    pub async fn is_paused(&self, name: &str) -> bool {
        self.pauses.read().await.is_paused(name)
    }

    pub async fn pause_info(&self, name: &str) -> Option<PauseInfo> {
        self.pauses.read().await.info(name).cloned()
    }

    /// Release a pipeline lock by hand. Refused while the holder still runs.
    pub async fn unlock(&self, name: &str, user: &str) -> OperationResult<()> {
        if let Err(e) = self.check_known_and_operable(name, user).await {
            return OperationResult::from_error(&e);
        }
        let outcome = async {
            let _guard = self.stages.serialize(name).await;
            let mut tx = self.transactions.begin();
            let Some(holder) = tx.lock_holder(name).await else {
                return Ok(false);
            };
            if tx
                .find_instance(name, holder)
                .await?
                .is_some_and(|instance| instance.any_active())
            {
                return Err(Error::AlreadyInProgress(format!(
                    "Locked pipeline instance {}/{} is currently running.",
                    name, holder
                )));
            }
            tx.unlock(name);
            tx.publish(Event::PipelineUnlocked(lock_event(name, holder)));
            tx.commit().await?;
            Ok::<_, Error>(true)
        }
        .await;

        match outcome {
            Ok(true) => {
                info!(pipeline = name, unlocked_by = user, "Pipeline lock released");
                OperationResult::ok_empty(format!("Pipeline lock released for {}", name))
            }
            Ok(false) => OperationResult::failure(
                StatusCategory::Conflict,
                format!("Lock for pipeline '{}' cannot be released because it is not locked.", name),
            ),
            Err(e) => OperationResult::from_error(&e),
        }
    }

    async fn check_known_and_operable(&self, name: &str, user: &str) -> Result<()> {
        let config = self.ports.config.current_config().await?;
        if !config.has_pipeline(name) {
            return Err(Error::PipelineNotFound(name.to_string()));
        }
        self.check_operate(user, name).await
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        self.locks.read().await.is_locked(name)
    }

    pub async fn health(&self) -> Vec<(HealthScope, HealthState)> {
        self.health.read().await.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::material::{Material, MaterialRevision, MaterialRevisions, Modification};
    use cadence_core::pipeline::{LockBehavior, PipelineConfig, StageConfig};
    use cadence_store::{
        MemoryConfigSource, MemoryMaterialPoller, MemoryPipelineRepository, StaticDiskSpace, StaticPermissions,
    };
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl EventListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_event(&self, event: &Event) -> Result<()> {
            self.0.lock().unwrap().push(event.subject());
            Ok(())
        }
    }

    struct Harness {
        service: ScheduleService,
        repo: Arc<MemoryPipelineRepository>,
        poller: Arc<MemoryMaterialPoller>,
        config: Arc<MemoryConfigSource>,
        disk: Arc<StaticDiskSpace>,
    }

    fn git(url: &str) -> Material {
        Material::git(url)
    }

    fn pipeline(name: &str) -> PipelineConfig {
        PipelineConfig::new(name)
            .with_material(git(&format!("https://example.com/{}", name)))
            .with_stage(StageConfig::new("dev", &["unit"]))
            .with_stage(StageConfig::new("ft", &["functional"]))
    }

    async fn harness(pipelines: Vec<PipelineConfig>, permissions: StaticPermissions) -> Harness {
        let repo = Arc::new(MemoryPipelineRepository::new());
        let poller = Arc::new(MemoryMaterialPoller::new(repo.clone()));
        let config = Arc::new(MemoryConfigSource::new(ConfigSnapshot::new(pipelines.clone())));
        let disk = Arc::new(StaticDiskSpace::new(10_000));
        for p in &pipelines {
            for material in &p.materials {
                poller.add_modification(material, Modification::new("r1", Utc::now())).await;
            }
        }
        let service = ScheduleService::new(
            SchedulerPorts {
                config: config.clone(),
                repo: repo.clone(),
                poller: poller.clone(),
                permissions: Arc::new(permissions),
                disk: disk.clone(),
            },
            SchedulerConfig::default(),
        );
        Harness {
            service,
            repo,
            poller,
            config,
            disk,
        }
    }

    fn cause(url: &str, revision: &str) -> BuildCause {
        let revisions = MaterialRevisions::from(vec![
            MaterialRevision::new(git(url), vec![Modification::new(revision, Utc::now())]).mark_changed(),
        ]);
        BuildCause::with_modifications(revisions, "changes")
    }

    #[tokio::test]
    async fn test_manual_schedule_then_drain() {
        let h = harness(vec![pipeline("cruise")], StaticPermissions::allow_all()).await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        h.service.register_listener(recorder.clone()).await;

        let result = h
            .service
            .schedule_manual("cruise", "admin", &BTreeMap::new(), BTreeMap::new())
            .await;
        assert_eq!(result.status, StatusCategory::Accepted);
        assert_eq!(result.message, "Request to schedule pipeline cruise accepted");

        let report = h.service.schedule_auto().await;
        assert_eq!(report.scheduled.len(), 1);
        assert_eq!(report.scheduled[0].counter, 1);

        let instance = h.repo.find_instance("cruise", 1).await.unwrap().unwrap();
        assert_eq!(instance.stage_order, vec!["dev", "ft"]);
        assert_eq!(instance.stages.len(), 1);
        assert_eq!(instance.stages[0].approved_by, "admin");
        assert!(instance.build_cause.forced);

        let subjects = recorder.0.lock().unwrap().clone();
        assert_eq!(subjects[0], "pipeline.scheduled.cruise.1");
        assert_eq!(subjects[1], "pipeline.cruise.1.stage.dev.1");

        // Idempotent on an empty queue
        assert_eq!(h.service.schedule_auto().await, DrainReport::default());
    }

    #[tokio::test]
    async fn test_manual_schedule_refusals() {
        let permissions = StaticPermissions::allow_all().deny_operate("guest", "cruise");
        let h = harness(vec![pipeline("cruise")], permissions).await;
        let none = BTreeMap::new();

        let result = h.service.schedule_manual("missing", "admin", &none, BTreeMap::new()).await;
        assert_eq!(result.status, StatusCategory::NotFound);

        let result = h.service.schedule_manual("cruise", "guest", &none, BTreeMap::new()).await;
        assert_eq!(result.status, StatusCategory::Unauthorized);
        assert_eq!(result.message, "You do not have operate permissions for pipeline 'cruise'.");

        assert!(h.service.schedule_manual("cruise", "admin", &none, BTreeMap::new()).await.is_success());
        let result = h.service.schedule_manual("cruise", "admin", &none, BTreeMap::new()).await;
        assert_eq!(result.status, StatusCategory::Conflict);

        h.service.schedule_auto().await;
        h.service.pause("cruise", "admin", "release freeze").await;
        let result = h.service.schedule_manual("cruise", "admin", &none, BTreeMap::new()).await;
        assert_eq!(result.message, "Pipeline 'cruise' is paused.");
    }

    #[tokio::test]
    async fn test_locked_pipeline_refuses_schedule() {
        let locked = pipeline("cruise").with_lock_behavior(LockBehavior::LockOnFailure);
        let h = harness(vec![locked], StaticPermissions::allow_all()).await;
        let none = BTreeMap::new();

        h.service.schedule_manual("cruise", "admin", &none, BTreeMap::new()).await;
        h.service.schedule_auto().await;
        assert!(h.service.is_locked("cruise").await);

        let result = h.service.schedule_manual("cruise", "admin", &none, BTreeMap::new()).await;
        assert_eq!(result.status, StatusCategory::Conflict);
        assert_eq!(result.message, "Pipeline 'cruise' is locked.");

        let result = h.service.unlock("cruise", "admin").await;
        assert!(result.message.contains("currently running"));
    }

    #[tokio::test]
    async fn test_drain_isolates_failures() {
        let h = harness(vec![pipeline("cruise"), pipeline("mingle")], StaticPermissions::allow_all()).await;
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        h.service.schedule("mingle", cause("https://example.com/mingle", "r1")).await;
        h.service.schedule("deleted", cause("https://example.com/deleted", "r1")).await;

        let report = h.service.schedule_auto().await;
        let scheduled: Vec<&str> = report.scheduled.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(scheduled, vec!["cruise", "mingle"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "deleted");

        let health = h.service.health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].0, HealthScope::Pipeline("deleted".to_string()));
    }

    #[tokio::test]
    async fn test_disk_guard_and_recovery() {
        let h = harness(vec![pipeline("cruise")], StaticPermissions::allow_all()).await;
        h.disk.set(10);
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;

        let report = h.service.schedule_auto().await;
        assert!(report.scheduled.is_empty());
        assert!(report.failed[0].1.contains("disk space"));
        assert!(h.service.pending_cause("cruise").await.is_none());

        h.disk.set(10_000);
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        let report = h.service.schedule_auto().await;
        assert_eq!(report.scheduled.len(), 1);
        assert!(h.service.health().await.is_empty());
    }

    #[tokio::test]
    async fn test_redundant_automatic_cause_discarded() {
        let h = harness(vec![pipeline("cruise")], StaticPermissions::allow_all()).await;
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        h.service.schedule_auto().await;

        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        let report = h.service.schedule_auto().await;
        assert_eq!(report.discarded, vec!["cruise".to_string()]);
        assert!(h.repo.find_instance("cruise", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_changed_pipelines() {
        let manual_first = PipelineConfig::new("gated")
            .with_material(git("https://example.com/gated"))
            .with_stage(StageConfig::new("dev", &["unit"]).manual());
        let h = harness(vec![pipeline("cruise"), manual_first], StaticPermissions::allow_all()).await;

        assert_eq!(h.service.trigger_changed_pipelines().await, vec!["cruise".to_string()]);
        h.service.schedule_auto().await;
        assert!(h.service.trigger_changed_pipelines().await.is_empty());

        h.poller
            .add_modification(&git("https://example.com/cruise"), Modification::new("r2", Utc::now()))
            .await;
        assert_eq!(h.service.trigger_changed_pipelines().await, vec!["cruise".to_string()]);
    }

    #[tokio::test]
    async fn test_rerun_stage_by_label() {
        let labelled = pipeline("cruise").with_label_template("build-${COUNT}");
        let permissions = StaticPermissions::allow_all().deny_operate("guest", "cruise");
        let h = harness(vec![labelled], permissions).await;
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        h.service.schedule_auto().await;

        let instance = h.repo.find_instance("cruise", 1).await.unwrap().unwrap();
        let job = instance.stages[0].jobs[0].id;
        h.service.complete_job(job, JobResult::Failed).await.unwrap();

        let result = h.service.rerun_stage("cruise", "build-1", "dev", "admin").await;
        assert_eq!(result.message, "Request to schedule stage cruise/1/dev accepted");
        assert_eq!(result.value.map(|s| s.counter), Some(2));

        let result = h.service.rerun_stage("cruise", "build-9", "dev", "admin").await;
        assert_eq!(result.status, StatusCategory::NotFound);

        let result = h.service.rerun_stage("cruise", "1", "dev", "guest").await;
        assert_eq!(result.status, StatusCategory::Unauthorized);
    }

    #[tokio::test]
    async fn test_cancel_messages() {
        let h = harness(vec![pipeline("cruise")], StaticPermissions::allow_all()).await;
        h.service.schedule("cruise", cause("https://example.com/cruise", "r1")).await;
        h.service.schedule_auto().await;
        let stage_id = h.repo.find_instance("cruise", 1).await.unwrap().unwrap().stages[0].id;

        let result = h.service.cancel_stage(stage_id, "admin").await;
        assert_eq!(result.message, "Stage cancelled successfully.");
        let result = h.service.cancel_stage(stage_id, "admin").await;
        assert_eq!(result.message, "Stage is not active. Cancellation Ignored.");

        let missing = StageInstanceId::new();
        let result = h.service.cancel_stage(missing, "admin").await;
        assert_eq!(result.status, StatusCategory::NotFound);
        assert_eq!(result.message, format!("Stage '{}' not found.", missing));
    }

    #[tokio::test]
    async fn test_pause_unpause_and_unlock_messages() {
        let h = harness(vec![pipeline("cruise")], StaticPermissions::allow_all()).await;
        assert!(h.service.pause("cruise", "admin", "freeze").await.is_success());
        assert_eq!(h.service.pause_info("cruise").await.map(|i| i.reason), Some("freeze".to_string()));
        assert_eq!(
            h.service.pause("cruise", "admin", "again").await.status,
            StatusCategory::Conflict
        );
        assert!(h.service.unpause("cruise", "admin").await.is_success());
        assert!(!h.service.is_paused("cruise").await);
        assert_eq!(h.service.pause("nope", "admin", "x").await.status, StatusCategory::NotFound);

        let result = h.service.unlock("cruise", "admin").await;
        assert_eq!(
            result.message,
            "Lock for pipeline 'cruise' cannot be released because it is not locked."
        );
        h.config.replace(ConfigSnapshot::new(vec![])).await;
        assert_eq!(h.service.unlock("cruise", "admin").await.status, StatusCategory::NotFound);
    }
}
