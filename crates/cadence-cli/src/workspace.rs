//! Workspace file: configuration, history and known commits in one YAML
//! document, loaded into the in-memory store.

use anyhow::Context;
use cadence_core::instance::PipelineInstance;
use cadence_core::material::{Fingerprint, Material, Modification};
use cadence_core::pipeline::{ConfigSnapshot, PipelineConfig};
use cadence_scheduler::{ScheduleService, SchedulerConfig, SchedulerPorts};
use cadence_store::{
    MemoryConfigSource, MemoryMaterialPoller, MemoryPipelineRepository, StaticDiskSpace,
    StaticPermissions,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Workspace {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    /// Previously created pipeline instances.
    #[serde(default)]
    pub history: Vec<PipelineInstance>,
    /// Known commits per SCM material, oldest first.
    #[serde(default)]
    pub modifications: Vec<MaterialHistory>,
    #[serde(default)]
    pub access: AccessRules,
    #[serde(default = "default_available_disk_mb")]
    pub available_disk_mb: u64,
}

fn default_available_disk_mb() -> u64 {
    u64::MAX
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MaterialHistory {
    pub material: Material,
    pub revisions: Vec<Modification>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccessRules {
    #[serde(default)]
    pub deny_view: Vec<UserPipeline>,
    #[serde(default)]
    pub deny_operate: Vec<UserPipeline>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UserPipeline {
    pub user: String,
    pub pipeline: String,
}

/// A scheduling service wired to the workspace contents.
pub struct Session {
    pub service: ScheduleService,
    pub repo: Arc<MemoryPipelineRepository>,
    pub config: Arc<ConfigSnapshot>,
}

impl Workspace {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workspace {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid workspace {}", path.display()))
    }

    /// Find a material of `pipeline` by display name or fingerprint.
    pub fn fingerprint_of(&self, pipeline: &str, material: &str) -> Option<Fingerprint> {
        let config = self.pipelines.iter().find(|p| p.name == pipeline)?;
        config
            .materials
            .iter()
            .find(|m| m.name() == material || m.fingerprint().as_str() == material)
            .map(Material::fingerprint)
    }

    pub async fn into_session(self, settings: SchedulerConfig) -> Session {
        let repo = Arc::new(MemoryPipelineRepository::with_instances(self.history).await);
        let poller = Arc::new(MemoryMaterialPoller::new(repo.clone()));
        for history in &self.modifications {
            for modification in &history.revisions {
                poller.add_modification(&history.material, modification.clone()).await;
            }
        }

        let permissions = self.access.deny_view.iter().fold(StaticPermissions::allow_all(), |p, rule| {
            p.deny_view(rule.user.as_str(), rule.pipeline.as_str())
        });
        let permissions = self.access.deny_operate.iter().fold(permissions, |p, rule| {
            p.deny_operate(rule.user.as_str(), rule.pipeline.as_str())
        });

        let config = Arc::new(ConfigSnapshot::new(self.pipelines));
        let ports = SchedulerPorts {
            config: Arc::new(MemoryConfigSource::new(config.as_ref().clone())),
            repo: repo.clone(),
            poller,
            permissions: Arc::new(permissions),
            disk: Arc::new(StaticDiskSpace::new(self.available_disk_mb)),
        };
        Session {
            service: ScheduleService::new(ports, settings),
            repo,
            config,
        }
    }
}
