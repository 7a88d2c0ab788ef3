//! Test fixtures for pipeline configs and recorded history.

use cadence_core::build_cause::BuildCause;
use cadence_core::instance::{JobResult, PipelineInstance, StageInstance};
use cadence_core::material::{DependencyRevision, Material, MaterialRevision, MaterialRevisions, Modification};
use cadence_core::pipeline::{PipelineConfig, StageConfig};
use chrono::Utc;

/// Stage every fixture pipeline starts with.
pub const FIRST_STAGE: &str = "dev";

/// Git material on `https://example.com/<name>`.
pub fn git(name: &str) -> Material {
    Material::git(format!("https://example.com/{}", name))
}

/// Dependency on the first stage of `upstream`.
pub fn upstream(name: &str) -> Material {
    Material::dependency(name, FIRST_STAGE)
}

/// Factory for creating test pipeline configs.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One `dev` stage with a `unit` job, building from `materials`.
    pub fn with_materials(name: &str, materials: Vec<Material>) -> PipelineConfig {
        materials
            .into_iter()
            .fold(PipelineConfig::new(name), PipelineConfig::with_material)
            .with_stage(StageConfig::new(FIRST_STAGE, &["unit"]))
    }

    /// Builds from its own git repository.
    pub fn single(name: &str) -> PipelineConfig {
        Self::with_materials(name, vec![git(name)])
    }

    /// `dev` then `ft`, building from its own git repository.
    pub fn two_stage(name: &str) -> PipelineConfig {
        Self::single(name).with_stage(StageConfig::new("ft", &["functional"]))
    }

    /// Depends on the `dev` stage of every pipeline in `upstreams`.
    pub fn downstream(name: &str, upstreams: &[&str]) -> PipelineConfig {
        Self::with_materials(name, upstreams.iter().map(|u| upstream(u)).collect())
    }

    /// `second <- git`, `third <- second`, `last <- third + second`.
    pub fn triangle() -> Vec<PipelineConfig> {
        vec![
            Self::single("second"),
            Self::downstream("third", &["second"]),
            Self::downstream("last", &["third", "second"]),
        ]
    }

    /// `up <- git`, `left <- up`, `right <- up`, `bottom <- left + right`.
    pub fn diamond() -> Vec<PipelineConfig> {
        vec![
            Self::single("up"),
            Self::downstream("left", &["up"]),
            Self::downstream("right", &["up"]),
            Self::downstream("bottom", &["left", "right"]),
        ]
    }
}

/// Builder for a historical pipeline instance.
pub struct InstanceFixture {
    instance: PipelineInstance,
}

impl InstanceFixture {
    pub fn new(name: &str, counter: u32) -> Self {
        Self {
            instance: PipelineInstance::new(
                name,
                counter,
                counter.to_string(),
                BuildCause::with_modifications(MaterialRevisions::new(), "changes"),
                vec![FIRST_STAGE.to_string()],
            ),
        }
    }

    /// Record an SCM revision in the build cause.
    pub fn built_from(mut self, material: Material, revision: &str) -> Self {
        let modification = Modification::new(revision, Utc::now());
        self.instance
            .build_cause
            .material_revisions
            .push(MaterialRevision::new(material, vec![modification]));
        self
    }

    /// Record that this instance was built from `pipeline/counter/dev/1`.
    pub fn built_after(mut self, pipeline: &str, counter: u32) -> Self {
        let revision = DependencyRevision::new(pipeline, counter, FIRST_STAGE, 1);
        let modification = Modification::dependency(&revision, counter.to_string(), Utc::now());
        self.instance
            .build_cause
            .material_revisions
            .push(MaterialRevision::new(upstream(pipeline), vec![modification]));
        self
    }

    /// Add a finished run of `stage` in which every job ended with `result`.
    pub fn finished(mut self, stage: &str, result: JobResult) -> Self {
        if !self.instance.stage_order.iter().any(|s| s == stage) {
            self.instance.stage_order.push(stage.to_string());
        }
        let order = self.instance.stage_position(stage).unwrap_or(1);
        let counter = self.instance.next_stage_counter(stage);
        let identifier = self.instance.identifier();
        let mut run = StageInstance::schedule(&identifier, &StageConfig::new(stage, &["unit"]), order, counter, "changes");
        for job in &mut run.jobs {
            // Fresh jobs are never terminal, so completing them cannot fail.
            let _ = job.complete(result);
        }
        run.refresh_completion();
        self.instance.stages.push(run);
        self
    }

    pub fn passed(self) -> Self {
        self.finished(FIRST_STAGE, JobResult::Passed)
    }

    pub fn build(self) -> PipelineInstance {
        self.instance
    }
}
