//! Test context wiring the scheduling service to the in-memory store.

use crate::fixtures::FIRST_STAGE;
use anyhow::Context;
use cadence_core::ids::{PipelineIdentifier, StageInstanceId};
use cadence_core::instance::{JobResult, PipelineInstance, StageInstance};
use cadence_core::material::{Material, Modification};
use cadence_core::pipeline::{ConfigSnapshot, PipelineConfig};
use cadence_core::ports::PipelineRepository;
use cadence_notify::{
    NotificationChannel, NotificationListener, NotificationPayload, NotificationTrigger, RecordingSender,
    WebhookConfig,
};
use cadence_scheduler::{DrainReport, ScheduleService, SchedulerConfig, SchedulerPorts};
use cadence_store::{
    MemoryConfigSource, MemoryMaterialPoller, MemoryPipelineRepository, StaticDiskSpace, StaticPermissions,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every trigger a notification channel can subscribe to.
pub const ALL_TRIGGERS: [NotificationTrigger; 8] = [
    NotificationTrigger::PipelineScheduled,
    NotificationTrigger::StageScheduled,
    NotificationTrigger::StagePassed,
    NotificationTrigger::StageFailed,
    NotificationTrigger::StageCancelled,
    NotificationTrigger::JobFailed,
    NotificationTrigger::PipelineLocked,
    NotificationTrigger::PipelineUnlocked,
];

/// Scheduling service over in-memory adapters.
pub struct TestContext {
    pub service: ScheduleService,
    pub repo: Arc<MemoryPipelineRepository>,
    pub poller: Arc<MemoryMaterialPoller>,
    pub config: Arc<MemoryConfigSource>,
    pub disk: Arc<StaticDiskSpace>,
    pub notifications: RecordingSender,
}

impl TestContext {
    pub async fn new(pipelines: Vec<PipelineConfig>) -> Self {
        Self::build(pipelines, Vec::new(), StaticPermissions::allow_all()).await
    }

    /// Context seeded with recorded pipeline history.
    pub async fn with_history(pipelines: Vec<PipelineConfig>, history: Vec<PipelineInstance>) -> Self {
        Self::build(pipelines, history, StaticPermissions::allow_all()).await
    }

    pub async fn build(
        pipelines: Vec<PipelineConfig>,
        history: Vec<PipelineInstance>,
        permissions: StaticPermissions,
    ) -> Self {
        crate::init_test_logging();

        let repo = Arc::new(MemoryPipelineRepository::with_instances(history).await);
        let poller = Arc::new(MemoryMaterialPoller::new(repo.clone()));
        let config = Arc::new(MemoryConfigSource::new(ConfigSnapshot::new(pipelines)));
        let disk = Arc::new(StaticDiskSpace::new(100_000));
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

        let notifications = RecordingSender::new();
        let channel = NotificationChannel::new("test", WebhookConfig::default()).with_triggers(&ALL_TRIGGERS);
        service
            .register_listener(Arc::new(NotificationListener::new(channel, Arc::new(notifications.clone()))))
            .await;

        Self {
            service,
            repo,
            poller,
            config,
            disk,
            notifications,
        }
    }

    /// Record a new commit on `material`.
    pub async fn commit(&self, material: &Material, revision: &str) {
        self.poller
            .add_modification(material, Modification::new(revision, Utc::now()))
            .await;
    }

    /// Poll every pipeline, then drain the queue once.
    pub async fn trigger(&self) -> DrainReport {
        self.service.trigger_changed_pipelines().await;
        self.service.schedule_auto().await
    }

    /// Force `name` as `admin` and drain. Returns the created instance.
    pub async fn force(&self, name: &str) -> anyhow::Result<PipelineIdentifier> {
        let result = self
            .service
            .schedule_manual(name, "admin", &BTreeMap::new(), BTreeMap::new())
            .await;
        anyhow::ensure!(result.is_success(), "{}", result.message);
        let report = self.service.schedule_auto().await;
        report
            .scheduled
            .into_iter()
            .find(|id| id.name == name)
            .with_context(|| format!("{} was not scheduled: {:?}", name, report.failed))
    }

    pub async fn instance(&self, name: &str, counter: u32) -> anyhow::Result<PipelineInstance> {
        self.repo
            .find_instance(name, counter)
            .await?
            .with_context(|| format!("No instance {}/{}", name, counter))
    }

    /// Latest run of `stage` in `name/counter`.
    pub async fn stage(&self, name: &str, counter: u32, stage: &str) -> anyhow::Result<StageInstance> {
        self.instance(name, counter)
            .await?
            .latest_stage(stage)
            .cloned()
            .with_context(|| format!("Stage {} never ran in {}/{}", stage, name, counter))
    }

    /// Complete every unfinished job of the latest run of `stage`.
    pub async fn finish_stage(&self, name: &str, counter: u32, stage: &str, result: JobResult) -> anyhow::Result<StageInstanceId> {
        let run = self.stage(name, counter, stage).await?;
        for job in run.current_jobs().filter(|j| j.is_active()) {
            self.service.complete_job(job.id, result).await?;
        }
        Ok(run.id)
    }

    pub async fn pass(&self, name: &str, counter: u32) -> anyhow::Result<StageInstanceId> {
        self.finish_stage(name, counter, FIRST_STAGE, JobResult::Passed).await
    }

    /// Subjects of every notification delivered so far.
    pub async fn subjects(&self) -> Vec<String> {
        self.notifications
            .sent()
            .await
            .into_iter()
            .filter_map(|p: NotificationPayload| p.subject)
            .collect()
    }
}
