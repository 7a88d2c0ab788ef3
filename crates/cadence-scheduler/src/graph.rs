//! Pipeline dependency graph.
//!
//! Built fresh from a [`ConfigSnapshot`] for every resolution. Nodes are
//! pipeline names and edges run from an upstream pipeline to the pipeline
//! that declares a dependency material on it, so one upstream may feed the
//! same downstream through several paths.

use cadence_core::material::{Fingerprint, Material};
use cadence_core::pipeline::ConfigSnapshot;
use cadence_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, Fingerprint>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn build(config: &ConfigSnapshot) -> Self {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for pipeline in config.iter() {
            let idx = graph.add_node(pipeline.name.clone());
            name_to_index.insert(pipeline.name.clone(), idx);
        }

        for pipeline in config.iter() {
            let downstream = name_to_index[&pipeline.name];
            for dep in pipeline.dependency_materials() {
                // Dependencies on deleted pipelines have no node to point at.
                let Some(&upstream) = name_to_index.get(&dep.pipeline) else {
                    continue;
                };
                let fingerprint = Material::Dependency(dep.clone()).fingerprint();
                graph.add_edge(upstream, downstream, fingerprint);
            }
        }

        Self {
            graph,
            name_to_index,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Pipelines `name` depends on directly.
    pub fn upstream_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Pipelines that depend on `name` directly.
    pub fn downstream_of(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.name_to_index.get(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .filter(|n| seen.insert(*n))
            .filter_map(|n| self.graph.node_weight(n))
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Fails when any pipeline `name` transitively depends on is part of a cycle.
    pub fn ensure_acyclic_upstream(&self, name: &str) -> Result<()> {
        let mut path = DescentPath::new();
        let mut done = HashSet::new();
        self.visit_upstream(name, &mut path, &mut done)
    }

    fn visit_upstream<'a>(
        &'a self,
        name: &'a str,
        path: &mut DescentPath,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if path.contains(name) {
            return Err(Error::UnsupportedTopology(format!(
                "Cyclic dependency detected: {} -> {}",
                path.describe(),
                name
            )));
        }
        if !done.insert(name) {
            return Ok(());
        }
        path.push(name);
        for upstream in self.upstream_of(name) {
            self.visit_upstream(upstream, path, done)?;
        }
        path.pop();
        Ok(())
    }

    /// Pipeline names with every upstream before its downstreams.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx))
                    .map(String::as_str)
                    .collect()
            })
            .map_err(|cycle| {
                let name = self
                    .graph
                    .node_weight(cycle.node_id())
                    .cloned()
                    .unwrap_or_default();
                Error::UnsupportedTopology(format!("Cyclic dependency detected at pipeline '{}'", name))
            })
    }
}

/// Pipeline names on the current branch of one traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescentPath(Vec<String>);

impl DescentPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn push(&mut self, name: impl Into<String>) {
        self.0.push(name.into());
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    /// Copy of this path extended by `name`.
    pub fn with(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.push(name);
        next
    }

    pub fn describe(&self) -> String {
        self.0.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::pipeline::{PipelineConfig, StageConfig};

    fn pipeline(name: &str, upstreams: &[&str]) -> PipelineConfig {
        let mut config = PipelineConfig::new(name).with_stage(StageConfig::new("stage", &["job"]));
        if upstreams.is_empty() {
            config = config.with_material(Material::git(format!("https://example.com/{}", name)));
        }
        for upstream in upstreams {
            config = config.with_material(Material::dependency(*upstream, "stage"));
        }
        config
    }

    #[test]
    fn test_diamond() {
        let config = ConfigSnapshot::new(vec![
            pipeline("second", &[]),
            pipeline("third", &["second"]),
            pipeline("last", &["third", "second"]),
        ]);
        let graph = DependencyGraph::build(&config);

        assert_eq!(graph.upstream_of("last"), vec!["second", "third"]);
        assert_eq!(graph.downstream_of("second"), vec!["last", "third"]);
        assert!(!graph.is_cyclic());
        assert!(graph.ensure_acyclic_upstream("last").is_ok());

        let order = graph.topological_order().unwrap();
        let position = |n: &str| order.iter().position(|o| *o == n).unwrap();
        assert!(position("second") < position("third"));
        assert!(position("third") < position("last"));
    }

    #[test]
    fn test_cycle_after_config_edit() {
        let config = ConfigSnapshot::new(vec![
            pipeline("a", &["b"]),
            pipeline("b", &["a"]),
            pipeline("c", &["a"]),
        ]);
        let graph = DependencyGraph::build(&config);

        assert!(graph.is_cyclic());
        let err = graph.ensure_acyclic_upstream("c").unwrap_err();
        assert!(matches!(err, Error::UnsupportedTopology(_)));
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_dependency_on_deleted_pipeline_is_ignored() {
        let config = ConfigSnapshot::new(vec![pipeline("down", &["gone"])]);
        let graph = DependencyGraph::build(&config);
        assert!(graph.upstream_of("down").is_empty());
        assert!(!graph.contains("gone"));
    }

    #[test]
    fn test_descent_path() {
        let path = DescentPath::starting_at("last").with("third");
        assert!(path.contains("last"));
        assert!(!path.contains("second"));
        assert_eq!(path.describe(), "last -> third");
    }
}
