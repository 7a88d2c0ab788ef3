//! In-memory material poller.
//!
//! SCM materials answer from modifications registered with
//! [`MemoryMaterialPoller::add_modification`]. Dependency materials answer
//! from pipeline history: every instance whose latest run of the upstream
//! stage passed is a revision.

use crate::repositories::MemoryPipelineRepository;
use async_trait::async_trait;
use cadence_core::material::{DependencyMaterial, DependencyRevision, Fingerprint, Material, Modification};
use cadence_core::ports::{MaterialPoller, PipelineRepository};
use cadence_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct MemoryMaterialPoller {
    history: Arc<MemoryPipelineRepository>,
    /// Oldest first.
    modifications: RwLock<HashMap<Fingerprint, Vec<Modification>>>,
    failures: RwLock<HashMap<Fingerprint, String>>,
}

impl MemoryMaterialPoller {
    pub fn new(history: Arc<MemoryPipelineRepository>) -> Self {
        Self {
            history,
            modifications: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new commit on an SCM material.
    pub async fn add_modification(&self, material: &Material, modification: Modification) {
        self.modifications
            .write()
            .await
            .entry(material.fingerprint())
            .or_default()
            .push(modification);
    }

    /// Make every poll of `material` fail with `message`.
    pub async fn fail_with(&self, material: &Material, message: impl Into<String>) {
        self.failures
            .write()
            .await
            .insert(material.fingerprint(), message.into());
    }

    pub async fn clear_failure(&self, material: &Material) {
        self.failures.write().await.remove(&material.fingerprint());
    }

    async fn scm_modifications(&self, fingerprint: &Fingerprint) -> Vec<Modification> {
        self.modifications
            .read()
            .await
            .get(fingerprint)
            .map(|mods| mods.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Passed runs of the upstream stage, newest first.
    async fn dependency_modifications(&self, dep: &DependencyMaterial) -> Result<Vec<Modification>> {
        let mut modifications = Vec::new();
        for instance in self.history.list_instances(&dep.pipeline).await?.iter().rev() {
            let Some(stage) = instance.latest_stage(&dep.stage) else {
                continue;
            };
            if !stage.passed() {
                continue;
            }
            let revision =
                DependencyRevision::new(&instance.name, instance.counter, &stage.name, stage.counter);
            let time = stage.completed_at.unwrap_or(stage.created_at);
            modifications.push(Modification::dependency(&revision, &instance.label, time));
        }
        Ok(modifications)
    }

    async fn known_modifications(&self, material: &Material) -> Result<Vec<Modification>> {
        if let Some(message) = self.failures.read().await.get(&material.fingerprint()) {
            return Err(Error::Poll(message.clone()));
        }
        match material {
            Material::Dependency(dep) => self.dependency_modifications(dep).await,
            Material::Scm(_) => Ok(self.scm_modifications(&material.fingerprint()).await),
        }
    }
}

#[async_trait]
impl MaterialPoller for MemoryMaterialPoller {
    async fn poll_for_modifications(
        &self,
        material: &Material,
        previous: Option<&str>,
    ) -> Result<Vec<Modification>> {
        let known = self.known_modifications(material).await?;
        let Some(previous) = previous else {
            return Ok(known.into_iter().take(1).collect());
        };

        let newer: Vec<Modification> = match material {
            Material::Dependency(_) => {
                let previous = DependencyRevision::parse(previous)?;
                known
                    .into_iter()
                    .filter(|m| {
                        DependencyRevision::parse(&m.revision).is_ok_and(|rev| {
                            (rev.counter, rev.stage_counter) > (previous.counter, previous.stage_counter)
                        })
                    })
                    .collect()
            }
            Material::Scm(_) => known
                .into_iter()
                .take_while(|m| m.revision != previous)
                .collect(),
        };
        debug!(
            material = material.name(),
            previous,
            found = newer.len(),
            "Polled for modifications"
        );
        Ok(newer)
    }

    async fn find_modification(
        &self,
        material: &Material,
        revision: &str,
    ) -> Result<Option<Modification>> {
        Ok(self
            .known_modifications(material)
            .await?
            .into_iter()
            .find(|m| m.revision == revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::build_cause::BuildCause;
    use cadence_core::instance::{JobResult, PipelineInstance, StageInstance};
    use cadence_core::pipeline::StageConfig;
    use chrono::Utc;

    fn passed_instance(name: &str, counter: u32) -> PipelineInstance {
        let mut instance =
            PipelineInstance::new(name, counter, counter.to_string(), BuildCause::empty(), vec!["dev".to_string()]);
        let identifier = instance.identifier();
        let mut stage =
            StageInstance::schedule(&identifier, &StageConfig::new("dev", &["unit"]), 1, 1, "changes");
        stage.jobs[0].complete(JobResult::Passed).unwrap();
        instance.stages.push(stage);
        instance
    }

    #[tokio::test]
    async fn test_scm_poll_since_previous() {
        let poller = MemoryMaterialPoller::new(Arc::new(MemoryPipelineRepository::new()));
        let git = Material::git("https://example.com/repo");
        for rev in ["a", "b", "c"] {
            poller.add_modification(&git, Modification::new(rev, Utc::now())).await;
        }

        let latest = poller.poll_for_modifications(&git, None).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].revision, "c");

        let newer = poller.poll_for_modifications(&git, Some("a")).await.unwrap();
        let revisions: Vec<&str> = newer.iter().map(|m| m.revision.as_str()).collect();
        assert_eq!(revisions, vec!["c", "b"]);

        assert!(poller.poll_for_modifications(&git, Some("c")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_poll_uses_passed_runs() {
        let history = Arc::new(
            MemoryPipelineRepository::with_instances(vec![passed_instance("up", 1), passed_instance("up", 2)])
                .await,
        );
        let poller = MemoryMaterialPoller::new(history);
        let dep = Material::dependency("up", "dev");

        let latest = poller.poll_for_modifications(&dep, None).await.unwrap();
        assert_eq!(latest[0].revision, "up/2/dev/1");
        assert_eq!(latest[0].pipeline_label.as_deref(), Some("2"));

        let newer = poller.poll_for_modifications(&dep, Some("up/1/dev/1")).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert!(poller.find_modification(&dep, "up/1/dev/1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let poller = MemoryMaterialPoller::new(Arc::new(MemoryPipelineRepository::new()));
        let git = Material::git("https://example.com/repo");
        poller.fail_with(&git, "connection refused").await;
        let err = poller.poll_for_modifications(&git, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Material poll failed: connection refused");
    }
}
