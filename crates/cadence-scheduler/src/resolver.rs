//! Fan-in resolution.
//!
//! Given the revisions observed for a pipeline's materials, walks the
//! recorded build causes of its upstream pipelines and rewrites every shared
//! material so the final set is one that was actually built together.
//!
//! The walk is breadth first from the pipeline's own dependency materials.
//! An upstream instance overrides a material only when the material is one
//! of the pipeline's own materials, the upstream's current config still
//! declares it, and it was not pegged by the caller. Once an upstream has
//! set a material, its own ancestors on that descent no longer touch it, so
//! the nearest upstream declaring a material decides its revision. Between
//! independent branches the node visited later wins.

use crate::graph::{DependencyGraph, DescentPath};
use cadence_core::material::{Fingerprint, Material, MaterialRevision, MaterialRevisions};
use cadence_core::pipeline::{ConfigSnapshot, PipelineConfig};
use cadence_core::ports::PipelineRepository;
use cadence_core::{Error, Result};
use cadence_trace::resolve_span;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{Instrument, debug};

/// One pending visit of an upstream instance.
#[derive(Debug)]
struct Descent {
    pipeline: String,
    counter: u32,
    path: DescentPath,
    /// Materials already set by a nearer upstream on this descent.
    fixed: HashSet<Fingerprint>,
}

pub struct FaninResolver {
    repo: Arc<dyn PipelineRepository>,
}

impl FaninResolver {
    pub fn new(repo: Arc<dyn PipelineRepository>) -> Self {
        Self { repo }
    }

    /// Resolve `observed` for `root` against the current config.
    ///
    /// Entries whose fingerprint is in `pegged` are returned verbatim. The
    /// result keeps the order of `observed` and its `changed` flags are
    /// recomputed against the most recent instance of `root`.
    pub async fn resolve(
        &self,
        config: &ConfigSnapshot,
        root: &PipelineConfig,
        observed: MaterialRevisions,
        pegged: &HashSet<Fingerprint>,
    ) -> Result<MaterialRevisions> {
        self.resolve_inner(config, root, observed, pegged)
            .instrument(resolve_span(&root.name))
            .await
    }

    async fn resolve_inner(
        &self,
        config: &ConfigSnapshot,
        root: &PipelineConfig,
        observed: MaterialRevisions,
        pegged: &HashSet<Fingerprint>,
    ) -> Result<MaterialRevisions> {
        DependencyGraph::build(config).ensure_acyclic_upstream(&root.name)?;

        let wanted: HashSet<Fingerprint> = observed.fingerprints().into_iter().collect();
        let mut result = observed;
        let mut queue = VecDeque::new();
        let root_path = DescentPath::starting_at(&root.name);

        // Unchanged upstreams already agree with the last build.
        for revision in result.iter() {
            if !revision.changed && !pegged.contains(&revision.fingerprint()) {
                continue;
            }
            let (Some(dep), Some(rev)) = (revision.material.as_dependency(), revision.dependency_revision())
            else {
                continue;
            };
            queue.push_back(Descent {
                pipeline: dep.pipeline.clone(),
                counter: rev.counter,
                path: root_path.clone(),
                fixed: HashSet::new(),
            });
        }

        while let Some(Descent {
            pipeline,
            counter,
            path,
            mut fixed,
        }) = queue.pop_front()
        {
            if path.contains(&pipeline) {
                return Err(Error::UnsupportedTopology(format!(
                    "Cyclic dependency detected: {} -> {}",
                    path.describe(),
                    pipeline
                )));
            }
            let Some(node) = config.pipeline(&pipeline) else {
                debug!(pipeline = %pipeline, "Upstream pipeline no longer configured, skipping");
                continue;
            };

            let cause = self.repo.find_build_cause(&pipeline, counter).await?;
            let mut set_here = Vec::new();
            for upstream in cause.material_revisions.iter() {
                let fingerprint = upstream.fingerprint();
                if !wanted.contains(&fingerprint)
                    || pegged.contains(&fingerprint)
                    || fixed.contains(&fingerprint)
                    || !node.declares(&fingerprint)
                {
                    continue;
                }
                if let Some(target) = result.find_mut(&fingerprint) {
                    if target.modifications != upstream.modifications {
                        debug!(
                            pipeline = %root.name,
                            material = upstream.material.name(),
                            from = target.latest_revision().unwrap_or_default(),
                            to = upstream.latest_revision().unwrap_or_default(),
                            via = %format!("{}/{}", pipeline, counter),
                            "Overriding material revision from upstream"
                        );
                    }
                    target.modifications = upstream.modifications.clone();
                    set_here.push(fingerprint);
                }
            }
            fixed.extend(set_here);

            let next = path.with(&pipeline);
            for dep in node.dependency_materials() {
                let fingerprint = Material::Dependency(dep.clone()).fingerprint();
                let Some(rev) = cause
                    .material_revisions
                    .find(&fingerprint)
                    .and_then(MaterialRevision::dependency_revision)
                else {
                    continue;
                };
                queue.push_back(Descent {
                    pipeline: dep.pipeline.clone(),
                    counter: rev.counter,
                    path: next.clone(),
                    fixed: fixed.clone(),
                });
            }
        }

        let previous = self.repo.most_recent(&root.name).await?;
        result.mark_changes_since(previous.as_ref().map(|p| &p.build_cause.material_revisions));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::build_cause::BuildCause;
    use cadence_core::instance::PipelineInstance;
    use cadence_core::material::{DependencyRevision, Modification};
    use cadence_core::pipeline::StageConfig;
    use cadence_store::MemoryPipelineRepository;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn git() -> Material {
        Material::git("https://example.com/second")
    }

    fn git_rev(rev: &str) -> MaterialRevision {
        MaterialRevision::new(git(), vec![Modification::new(rev, Utc::now())])
    }

    fn dep_rev(pipeline: &str, counter: u32) -> MaterialRevision {
        MaterialRevision::new(
            Material::dependency(pipeline, "stage"),
            vec![Modification::dependency(
                &DependencyRevision::new(pipeline, counter, "stage", 1),
                counter.to_string(),
                Utc::now(),
            )],
        )
    }

    fn instance(name: &str, counter: u32, revisions: Vec<MaterialRevision>) -> PipelineInstance {
        PipelineInstance::new(
            name,
            counter,
            counter.to_string(),
            BuildCause::with_modifications(revisions.into(), "changes"),
            vec!["stage".to_string()],
        )
    }

    fn pipeline(name: &str, materials: Vec<Material>) -> PipelineConfig {
        materials
            .into_iter()
            .fold(PipelineConfig::new(name), PipelineConfig::with_material)
            .with_stage(StageConfig::new("stage", &["job"]))
    }

    /// second <- git, third <- second, last <- third + second.
    async fn triangle() -> (ConfigSnapshot, FaninResolver) {
        let config = ConfigSnapshot::new(vec![
            pipeline("second", vec![git()]),
            pipeline("third", vec![Material::dependency("second", "stage")]),
            pipeline(
                "last",
                vec![Material::dependency("third", "stage"), Material::dependency("second", "stage")],
            ),
        ]);
        let repo = MemoryPipelineRepository::with_instances(vec![
            instance("second", 2, vec![git_rev("1")]),
            instance("second", 4, vec![git_rev("2")]),
            instance("third", 3, vec![dep_rev("second", 2)]),
        ])
        .await;
        (config, FaninResolver::new(Arc::new(repo)))
    }

    fn summary(revisions: &MaterialRevisions) -> Vec<Option<String>> {
        revisions
            .iter()
            .map(|r| r.latest_revision().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_third_changed_picks_second_it_was_built_with() {
        let (config, resolver) = triangle().await;
        let root = config.pipeline("last").unwrap().clone();
        let observed: MaterialRevisions =
            vec![dep_rev("third", 3).mark_changed(), dep_rev("second", 4)].into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(
            summary(&resolved),
            vec![Some("third/3/stage/1".to_string()), Some("second/2/stage/1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_second_changed_alone_keeps_newest_second() {
        let (config, resolver) = triangle().await;
        let root = config.pipeline("last").unwrap().clone();
        let observed: MaterialRevisions =
            vec![dep_rev("third", 3), dep_rev("second", 4).mark_changed()].into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(
            summary(&resolved),
            vec![Some("third/3/stage/1".to_string()), Some("second/4/stage/1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_both_changed_third_branch_wins() {
        let (config, resolver) = triangle().await;
        let root = config.pipeline("last").unwrap().clone();
        let observed: MaterialRevisions = vec![
            dep_rev("second", 4).mark_changed(),
            dep_rev("third", 3).mark_changed(),
        ]
        .into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(
            summary(&resolved),
            vec![Some("second/2/stage/1".to_string()), Some("third/3/stage/1".to_string())]
        );
        // No earlier build of `last`, so everything counts as changed.
        assert!(resolved.iter().all(|r| r.changed));
    }

    #[tokio::test]
    async fn test_pegged_material_is_left_alone() {
        let (config, resolver) = triangle().await;
        let root = config.pipeline("last").unwrap().clone();
        let observed: MaterialRevisions =
            vec![dep_rev("third", 3).mark_changed(), dep_rev("second", 4)].into();
        let pegged: HashSet<Fingerprint> =
            [Material::dependency("second", "stage").fingerprint()].into_iter().collect();

        let resolved = resolver.resolve(&config, &root, observed, &pegged).await.unwrap();

        assert_eq!(resolved.get(1).and_then(|r| r.latest_revision()), Some("second/4/stage/1"));
    }

    #[tokio::test]
    async fn test_upstream_that_dropped_material_is_ignored() {
        let hg = Material::hg("https://example.com/hg");
        let config = ConfigSnapshot::new(vec![
            pipeline("up1", vec![]),
            pipeline("current", vec![hg.clone(), Material::dependency("up1", "stage")]),
        ]);
        let upstream_hg = MaterialRevision::new(hg.clone(), vec![Modification::new("first", Utc::now())]);
        let repo = MemoryPipelineRepository::with_instances(vec![instance("up1", 1, vec![upstream_hg])]).await;
        let resolver = FaninResolver::new(Arc::new(repo));
        let root = config.pipeline("current").unwrap().clone();
        let observed: MaterialRevisions = vec![
            MaterialRevision::new(hg, vec![Modification::new("third", Utc::now())]),
            dep_rev("up1", 1).mark_changed(),
        ]
        .into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(resolved.get(0).and_then(|r| r.latest_revision()), Some("third"));
    }

    #[tokio::test]
    async fn test_nearest_upstream_decides_shared_material() {
        // current <- hg + up1, up1 <- up0 + hg, up0 <- hg.
        let hg = Material::hg("https://example.com/hg");
        let hg_rev = |rev: &str| MaterialRevision::new(hg.clone(), vec![Modification::new(rev, Utc::now())]);
        let config = ConfigSnapshot::new(vec![
            pipeline("up0", vec![hg.clone()]),
            pipeline("up1", vec![Material::dependency("up0", "stage"), hg.clone()]),
            pipeline("current", vec![hg.clone(), Material::dependency("up1", "stage")]),
        ]);
        let repo = MemoryPipelineRepository::with_instances(vec![
            instance("up0", 2, vec![hg_rev("h1")]),
            instance("up1", 1, vec![dep_rev("up0", 2), hg_rev("h2")]),
        ])
        .await;
        let resolver = FaninResolver::new(Arc::new(repo));
        let root = config.pipeline("current").unwrap().clone();
        let observed: MaterialRevisions = vec![hg_rev("h3").mark_changed(), dep_rev("up1", 1).mark_changed()].into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(
            summary(&resolved),
            vec![Some("h2".to_string()), Some("up1/1/stage/1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unchanged_against_previous_build() {
        let (config, resolver) = triangle().await;
        let previous = instance("last", 1, vec![dep_rev("third", 3), dep_rev("second", 2)]);
        resolver.repo.save_instance(&previous).await.unwrap();
        let root = config.pipeline("last").unwrap().clone();
        let observed: MaterialRevisions =
            vec![dep_rev("third", 3).mark_changed(), dep_rev("second", 4)].into();

        let resolved = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap();

        assert!(!resolved.has_changed());
    }

    #[tokio::test]
    async fn test_cycle_introduced_by_config_edit() {
        let config = ConfigSnapshot::new(vec![
            pipeline("a", vec![Material::dependency("b", "stage")]),
            pipeline("b", vec![Material::dependency("a", "stage")]),
        ]);
        let repo = MemoryPipelineRepository::with_instances(vec![instance("b", 1, vec![git_rev("1")])]).await;
        let resolver = FaninResolver::new(Arc::new(repo));
        let root = config.pipeline("a").unwrap().clone();
        let observed: MaterialRevisions = vec![dep_rev("b", 1).mark_changed()].into();

        let err = resolver
            .resolve(&config, &root, observed, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedTopology(_)));
    }
}
