//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that poll materials, persist history and check permissions.

use crate::build_cause::BuildCause;
use crate::events::Event;
use crate::ids::*;
use crate::instance::PipelineInstance;
use crate::material::{Material, Modification};
use crate::pipeline::ConfigSnapshot;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Change detection for one material.
#[async_trait]
pub trait MaterialPoller: Send + Sync {
    /// Modifications after `previous`, newest first.
    ///
    /// With no previous revision only the latest modification is returned.
    /// An empty list means nothing changed.
    async fn poll_for_modifications(
        &self,
        material: &Material,
        previous: Option<&str>,
    ) -> Result<Vec<Modification>>;

    /// Look up a known revision of a material.
    async fn find_modification(
        &self,
        material: &Material,
        revision: &str,
    ) -> Result<Option<Modification>>;
}

/// Source of the current pipeline configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Immutable snapshot of every configured pipeline.
    async fn current_config(&self) -> Result<Arc<ConfigSnapshot>>;
}

/// Persisted pipeline history.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Get an instance by name and counter.
    async fn find_instance(&self, name: &str, counter: u32) -> Result<Option<PipelineInstance>>;

    /// Get an instance by name and label.
    async fn find_instance_by_label(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<PipelineInstance>>;

    /// Get the instance with the highest counter.
    async fn most_recent(&self, name: &str) -> Result<Option<PipelineInstance>>;

    /// All instances of a pipeline, lowest counter first.
    async fn list_instances(&self, name: &str) -> Result<Vec<PipelineInstance>>;

    /// Get the instance owning a stage run.
    async fn find_instance_by_stage(&self, id: StageInstanceId) -> Result<Option<PipelineInstance>>;

    /// Get the instance owning a job run.
    async fn find_instance_by_job(&self, id: JobInstanceId) -> Result<Option<PipelineInstance>>;

    /// Insert or replace instances as one atomic write.
    async fn save_instances(&self, instances: &[PipelineInstance]) -> Result<()>;

    /// Insert or replace a single instance.
    async fn save_instance(&self, instance: &PipelineInstance) -> Result<()> {
        self.save_instances(std::slice::from_ref(instance)).await
    }

    /// The build cause recorded on an instance.
    async fn find_build_cause(&self, name: &str, counter: u32) -> Result<BuildCause> {
        self.find_instance(name, counter)
            .await?
            .map(|instance| instance.build_cause)
            .ok_or_else(|| Error::instance_not_found(name, counter))
    }
}

/// Permission checks for pipelines.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether `user` may see the pipeline's history.
    async fn can_view(&self, user: &str, pipeline: &str) -> bool;

    /// Whether `user` may trigger, rerun or cancel the pipeline.
    async fn can_operate(&self, user: &str, pipeline: &str) -> bool;
}

/// Free disk space on the artifact volume.
#[async_trait]
pub trait DiskSpaceProbe: Send + Sync {
    async fn available_mb(&self) -> Result<u64>;
}

/// Receives events after the transaction that raised them has committed.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one event. Errors are logged and never undo the commit.
    async fn on_event(&self, event: &Event) -> Result<()>;
}
