//! Pipeline configuration snapshot types.
//!
//! These types represent the configured pipelines the scheduler reads on
//! every operation. A [`ConfigSnapshot`] is immutable; the core never edits
//! it in place.

use crate::material::{DependencyMaterial, Fingerprint, Material};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_label_template")]
    pub label_template: String,
    #[serde(default)]
    pub lock_behavior: LockBehavior,
    pub materials: Vec<Material>,
    pub stages: Vec<StageConfig>,
}

fn default_label_template() -> String {
    "${COUNT}".to_string()
}

/// How a pipeline serializes its runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockBehavior {
    #[default]
    None,
    /// Stays locked until the last stage completes.
    LockOnFailure,
    /// Unlocks as soon as the run is finished, even on failure.
    UnlockWhenFinished,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub approval: Approval,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    #[default]
    Success,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobConfig {
    pub name: String,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl StageConfig {
    pub fn new(name: impl Into<String>, jobs: &[&str]) -> Self {
        Self {
            name: name.into(),
            approval: Approval::Success,
            jobs: jobs.iter().map(|j| JobConfig::new(*j)).collect(),
        }
    }

    pub fn manual(mut self) -> Self {
        self.approval = Approval::Manual;
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.approval == Approval::Manual
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label_template: default_label_template(),
            lock_behavior: LockBehavior::None,
            materials: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.materials.push(material);
        self
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_lock_behavior(mut self, behavior: LockBehavior) -> Self {
        self.lock_behavior = behavior;
        self
    }

    pub fn with_label_template(mut self, template: impl Into<String>) -> Self {
        self.label_template = template.into();
        self
    }

    pub fn is_locked(&self) -> bool {
        self.lock_behavior != LockBehavior::None
    }

    pub fn is_unlockable_when_finished(&self) -> bool {
        self.lock_behavior == LockBehavior::UnlockWhenFinished
    }

    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    pub fn is_first_stage(&self, stage: &str) -> bool {
        self.first_stage().is_some_and(|s| s.name == stage)
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Stage declared immediately before `name` in the current config.
    pub fn previous_stage(&self, name: &str) -> Option<&StageConfig> {
        let index = self.stages.iter().position(|s| s.name == name)?;
        index.checked_sub(1).and_then(|i| self.stages.get(i))
    }

    /// Whether `fingerprint` is one of this pipeline's declared materials.
    pub fn declares(&self, fingerprint: &Fingerprint) -> bool {
        self.material(fingerprint).is_some()
    }

    pub fn material(&self, fingerprint: &Fingerprint) -> Option<&Material> {
        self.materials.iter().find(|m| &m.fingerprint() == fingerprint)
    }

    pub fn dependency_materials(&self) -> impl Iterator<Item = &DependencyMaterial> {
        self.materials.iter().filter_map(Material::as_dependency)
    }

    /// Whether this pipeline declares a dependency on `upstream`.
    pub fn depends_on(&self, upstream: &str) -> bool {
        self.dependency_materials().any(|d| d.pipeline == upstream)
    }
}

/// Immutable set of pipeline configs the scheduler works against.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl ConfigSnapshot {
    pub fn new(pipelines: Vec<PipelineConfig>) -> Self {
        Self { pipelines }
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn has_pipeline(&self, name: &str) -> bool {
        self.pipeline(name).is_some()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.iter().map(|p| p.name.clone()).collect()
    }

    /// Pipelines that declare a dependency material on `upstream`.
    pub fn downstream_of(&self, upstream: &str) -> Vec<&PipelineConfig> {
        self.pipelines
            .iter()
            .filter(|p| p.depends_on(upstream))
            .collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PipelineConfig> {
        self.pipelines.iter()
    }
}
