//! Build cause production.
//!
//! Polls a pipeline's materials, runs fan-in resolution and decides whether
//! the result is worth a new instance.

use crate::resolver::FaninResolver;
use cadence_core::build_cause::BuildCause;
use cadence_core::material::{Fingerprint, MaterialRevision, MaterialRevisions};
use cadence_core::pipeline::{ConfigSnapshot, PipelineConfig};
use cadence_core::ports::{MaterialPoller, PipelineRepository};
use cadence_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct BuildCauseProducer {
    poller: Arc<dyn MaterialPoller>,
    repo: Arc<dyn PipelineRepository>,
    resolver: FaninResolver,
}

impl BuildCauseProducer {
    pub fn new(poller: Arc<dyn MaterialPoller>, repo: Arc<dyn PipelineRepository>) -> Self {
        Self {
            poller,
            resolver: FaninResolver::new(repo.clone()),
            repo,
        }
    }

    pub fn resolver(&self) -> &FaninResolver {
        &self.resolver
    }

    async fn previous_revisions(&self, pipeline: &PipelineConfig) -> Result<Option<MaterialRevisions>> {
        Ok(self
            .repo
            .most_recent(&pipeline.name)
            .await?
            .map(|instance| instance.build_cause.material_revisions))
    }

    /// Poll every material since the revision the last build used.
    ///
    /// Materials with new modifications are marked changed; the others
    /// repeat what the last build used. `None` when some material has
    /// never produced a revision.
    pub async fn observe(
        &self,
        pipeline: &PipelineConfig,
        previous: Option<&MaterialRevisions>,
    ) -> Result<Option<MaterialRevisions>> {
        let mut observed = MaterialRevisions::new();
        for material in &pipeline.materials {
            let before = previous.and_then(|p| p.find(&material.fingerprint()));
            let since = before.and_then(MaterialRevision::latest_revision);
            let modifications = self.poller.poll_for_modifications(material, since).await?;

            if !modifications.is_empty() {
                observed.push(MaterialRevision::new(material.clone(), modifications).mark_changed());
            } else if let Some(before) = before {
                observed.push(MaterialRevision::new(material.clone(), before.modifications.clone()));
            } else {
                debug!(pipeline = %pipeline.name, material = material.name(), "No revisions known yet");
                return Ok(None);
            }
        }
        Ok(Some(observed))
    }

    /// Cause for an automatic trigger, or `None` when nothing changed.
    pub async fn auto_build_cause(
        &self,
        config: &ConfigSnapshot,
        pipeline: &PipelineConfig,
        approver: &str,
    ) -> Result<Option<BuildCause>> {
        let previous = self.previous_revisions(pipeline).await?;
        let Some(observed) = self.observe(pipeline, previous.as_ref()).await? else {
            return Ok(None);
        };
        if !observed.has_changed() {
            return Ok(None);
        }

        let resolved = self
            .resolver
            .resolve(config, pipeline, observed, &HashSet::new())
            .await?;
        if !resolved.has_changed() {
            debug!(pipeline = %pipeline.name, "Resolved revisions match the last build");
            return Ok(None);
        }
        Ok(Some(BuildCause::with_modifications(resolved, approver)))
    }

    /// Cause for a manual trigger.
    ///
    /// Materials named in `overrides` are pegged to the given revision; the
    /// rest use their latest revision.
    pub async fn manual_build_cause(
        &self,
        config: &ConfigSnapshot,
        pipeline: &PipelineConfig,
        user: &str,
        overrides: &BTreeMap<Fingerprint, String>,
        variables: BTreeMap<String, String>,
    ) -> Result<BuildCause> {
        if let Some(unknown) = overrides.keys().find(|fp| !pipeline.declares(fp)) {
            return Err(Error::MaterialNotFound(unknown.to_string()));
        }
        let previous = self.previous_revisions(pipeline).await?;

        let mut observed = MaterialRevisions::new();
        let mut pegged = HashSet::new();
        for material in &pipeline.materials {
            let fingerprint = material.fingerprint();
            let before = previous.as_ref().and_then(|p| p.find(&fingerprint));

            let modifications = match overrides.get(&fingerprint) {
                Some(revision) => {
                    let modification = self
                        .poller
                        .find_modification(material, revision)
                        .await?
                        .ok_or_else(|| {
                            Error::InvalidRequest(format!(
                                "Unable to find revision [{}] for material [{}]",
                                revision,
                                material.name()
                            ))
                        })?;
                    pegged.insert(fingerprint);
                    vec![modification]
                }
                None => {
                    let latest = self.poller.poll_for_modifications(material, None).await?;
                    match (latest.is_empty(), before) {
                        (false, _) => latest,
                        (true, Some(before)) => before.modifications.clone(),
                        (true, None) => return Err(Error::NoModifications(pipeline.name.clone())),
                    }
                }
            };

            let revision = MaterialRevision::new(material.clone(), modifications);
            if revision.has_changed_since(before) {
                observed.push(revision.mark_changed());
            } else {
                observed.push(revision);
            }
        }

        let resolved = self.resolver.resolve(config, pipeline, observed, &pegged).await?;
        Ok(BuildCause::manual_forced(resolved, user).with_variables(variables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::instance::PipelineInstance;
    use cadence_core::material::{Material, Modification};
    use cadence_core::pipeline::StageConfig;
    use cadence_store::{MemoryMaterialPoller, MemoryPipelineRepository};
    use chrono::Utc;

    fn git() -> Material {
        Material::git("https://example.com/cruise")
    }

    fn cruise() -> PipelineConfig {
        PipelineConfig::new("cruise")
            .with_material(git())
            .with_stage(StageConfig::new("dev", &["unit"]))
    }

    async fn producer() -> (BuildCauseProducer, Arc<MemoryMaterialPoller>, Arc<MemoryPipelineRepository>) {
        let repo = Arc::new(MemoryPipelineRepository::new());
        let poller = Arc::new(MemoryMaterialPoller::new(repo.clone()));
        (BuildCauseProducer::new(poller.clone(), repo.clone()), poller, repo)
    }

    #[tokio::test]
    async fn test_first_poll_produces_cause() {
        let (producer, poller, _) = producer().await;
        poller.add_modification(&git(), Modification::new("abc", Utc::now())).await;
        let config = ConfigSnapshot::new(vec![cruise()]);

        let cause = tokio_test::assert_ok!(producer.auto_build_cause(&config, &cruise(), "changes").await)
            .expect("a first commit is a change");
        assert!(!cause.forced);
        assert_eq!(cause.material_revisions.get(0).and_then(|r| r.latest_revision()), Some("abc"));
    }

    #[tokio::test]
    async fn test_no_new_commits_produces_nothing() {
        let (producer, poller, repo) = producer().await;
        poller.add_modification(&git(), Modification::new("abc", Utc::now())).await;
        let config = ConfigSnapshot::new(vec![cruise()]);
        let cause = producer
            .auto_build_cause(&config, &cruise(), "changes")
            .await
            .unwrap()
            .unwrap();
        repo.save_instance(&PipelineInstance::new("cruise", 1, "1", cause, vec!["dev".to_string()]))
            .await
            .unwrap();

        assert!(producer.auto_build_cause(&config, &cruise(), "changes").await.unwrap().is_none());

        poller.add_modification(&git(), Modification::new("def", Utc::now())).await;
        let next = producer.auto_build_cause(&config, &cruise(), "changes").await.unwrap().unwrap();
        assert_eq!(next.material_revisions.get(0).and_then(|r| r.latest_revision()), Some("def"));
    }

    #[tokio::test]
    async fn test_material_without_revisions() {
        let (producer, _, _) = producer().await;
        let config = ConfigSnapshot::new(vec![cruise()]);
        assert!(producer.auto_build_cause(&config, &cruise(), "changes").await.unwrap().is_none());

        let err = producer
            .manual_build_cause(&config, &cruise(), "admin", &BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoModifications(_)));
    }

    #[tokio::test]
    async fn test_manual_pegs_revision() {
        let (producer, poller, _) = producer().await;
        poller.add_modification(&git(), Modification::new("old", Utc::now())).await;
        poller.add_modification(&git(), Modification::new("new", Utc::now())).await;
        let config = ConfigSnapshot::new(vec![cruise()]);
        let overrides: BTreeMap<Fingerprint, String> = [(git().fingerprint(), "old".to_string())].into();
        let variables: BTreeMap<String, String> = [("DEPLOY".to_string(), "false".to_string())].into();

        let cause = producer
            .manual_build_cause(&config, &cruise(), "admin", &overrides, variables.clone())
            .await
            .unwrap();

        assert!(cause.forced);
        assert_eq!(cause.approver, "admin");
        assert_eq!(cause.variables, variables);
        assert_eq!(cause.material_revisions.get(0).and_then(|r| r.latest_revision()), Some("old"));
    }

    #[tokio::test]
    async fn test_manual_rejects_unknown_material_and_revision() {
        let (producer, poller, _) = producer().await;
        poller.add_modification(&git(), Modification::new("abc", Utc::now())).await;
        let config = ConfigSnapshot::new(vec![cruise()]);

        let foreign: BTreeMap<Fingerprint, String> =
            [(Material::svn("https://example.com/other").fingerprint(), "1".to_string())].into();
        let err = producer
            .manual_build_cause(&config, &cruise(), "admin", &foreign, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaterialNotFound(_)));

        let missing: BTreeMap<Fingerprint, String> = [(git().fingerprint(), "zzz".to_string())].into();
        let err = producer
            .manual_build_cause(&config, &cruise(), "admin", &missing, BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to find revision [zzz] for material [https://example.com/cruise]"
        );
    }
}
