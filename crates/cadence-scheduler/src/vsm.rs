//! Value stream map of a historical pipeline instance.
//!
//! Upstream nodes come from the build causes recorded on the anchor and its
//! ancestors. Downstream nodes come from the current config, with the
//! instances that were built from revisions already on the map.

use crate::graph::{DependencyGraph, DescentPath};
use cadence_core::build_cause::BuildCause;
use cadence_core::material::Material;
use cadence_core::pipeline::ConfigSnapshot;
use cadence_core::ports::{ConfigSource, PermissionChecker, PipelineRepository};
use cadence_core::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Pipeline,
    Material,
    Dummy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewType {
    NoPermission,
    Deleted,
    Warning,
}

/// A pipeline counter or a material revision shown on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRevision {
    pub revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VsmNode {
    /// Pipeline name, material fingerprint or generated dummy id.
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub level: i32,
    pub revisions: Vec<NodeRevision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_type: Option<ViewType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
}

impl VsmNode {
    fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            level: 0,
            revisions: Vec::new(),
            view_type: None,
            message: None,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    fn add_revision(&mut self, revision: NodeRevision) {
        if !self.revisions.contains(&revision) {
            self.revisions.push(revision);
        }
    }

    fn mark(&mut self, view_type: ViewType, message: String) {
        self.view_type = Some(view_type);
        self.message = Some(message);
    }
}

/// A leveled dependency map anchored on one pipeline instance.
#[derive(Debug, Clone, Serialize)]
pub struct ValueStreamMap {
    pub anchor: String,
    pub nodes: Vec<VsmNode>,
}

impl ValueStreamMap {
    pub fn node(&self, id: &str) -> Option<&VsmNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn anchor_node(&self) -> Option<&VsmNode> {
        self.node(&self.anchor)
    }

    /// Nodes grouped per level, leftmost level first.
    pub fn levels(&self) -> Vec<Vec<&VsmNode>> {
        let mut levels: BTreeMap<i32, Vec<&VsmNode>> = BTreeMap::new();
        for node in &self.nodes {
            levels.entry(node.level).or_default().push(node);
        }
        levels.into_values().collect()
    }
}

/// Nodes and edges collected before levels are assigned.
#[derive(Default)]
struct MapBuilder {
    nodes: Vec<VsmNode>,
    index: HashMap<String, usize>,
    edges: BTreeSet<(usize, usize)>,
}

impl MapBuilder {
    fn node(&mut self, id: &str, name: &str, kind: NodeKind) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        self.nodes.push(VsmNode::new(id, name, kind));
        let idx = self.nodes.len() - 1;
        self.index.insert(id.to_string(), idx);
        idx
    }

    fn edge(&mut self, parent: usize, child: usize) {
        self.edges.insert((parent, child));
    }

    fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph())
    }

    fn graph(&self) -> DiGraph<usize, ()> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), self.edges.len());
        for idx in 0..self.nodes.len() {
            graph.add_node(idx);
        }
        for &(parent, child) in &self.edges {
            graph.add_edge(NodeIndex::new(parent), NodeIndex::new(child), ());
        }
        graph
    }

    /// Longest-path levels: negative upstream of the anchor, positive downstream.
    fn assign_levels(&mut self, anchor: usize) -> Result<()> {
        let graph = self.graph();
        let order = toposort(&graph, None)
            .map_err(|_| Error::UnsupportedTopology("Cyclic value stream map".to_string()))?;

        let mut upstream: HashMap<usize, i32> = HashMap::from([(anchor, 0)]);
        for idx in order.iter().rev() {
            let node = idx.index();
            if node == anchor {
                continue;
            }
            let distance = graph
                .neighbors_directed(*idx, petgraph::Direction::Outgoing)
                .filter_map(|child| upstream.get(&child.index()))
                .max()
                .map(|d| d + 1);
            if let Some(distance) = distance {
                upstream.insert(node, distance);
            }
        }

        let mut downstream: HashMap<usize, i32> = HashMap::from([(anchor, 0)]);
        for idx in &order {
            let node = idx.index();
            if node == anchor {
                continue;
            }
            let distance = graph
                .neighbors_directed(*idx, petgraph::Direction::Incoming)
                .filter_map(|parent| downstream.get(&parent.index()))
                .max()
                .map(|d| d + 1);
            if let Some(distance) = distance {
                downstream.insert(node, distance);
            }
        }

        for (idx, node) in self.nodes.iter_mut().enumerate() {
            node.level = match (upstream.get(&idx), downstream.get(&idx)) {
                (Some(up), _) => -up,
                (None, Some(down)) => *down,
                (None, None) => 0,
            };
        }
        Ok(())
    }

    /// Replace every edge spanning more than one level with a chain of dummies.
    fn insert_dummies(&mut self) {
        let edges: Vec<(usize, usize)> = self.edges.iter().copied().collect();
        for (parent, child) in edges {
            let (from, to) = (self.nodes[parent].level, self.nodes[child].level);
            if to - from <= 1 {
                continue;
            }
            self.edges.remove(&(parent, child));
            let mut previous = parent;
            for level in from + 1..to {
                let id = format!("dummy:{}:{}:{}", self.nodes[parent].id, self.nodes[child].id, level);
                let dummy = self.node(&id, "", NodeKind::Dummy);
                self.nodes[dummy].level = level;
                self.edge(previous, dummy);
                previous = dummy;
            }
            self.edge(previous, child);
        }
    }

    fn finish(mut self, anchor: usize) -> ValueStreamMap {
        for &(parent, child) in &self.edges {
            let (parent_id, child_id) = (self.nodes[parent].id.clone(), self.nodes[child].id.clone());
            self.nodes[parent].children.push(child_id);
            self.nodes[child].parents.push(parent_id);
        }
        ValueStreamMap {
            anchor: self.nodes[anchor].id.clone(),
            nodes: self.nodes,
        }
    }
}

/// Renders value stream maps against the current config.
pub struct ValueStreamMapRenderer {
    config: Arc<dyn ConfigSource>,
    repo: Arc<dyn PipelineRepository>,
    permissions: Arc<dyn PermissionChecker>,
}

impl ValueStreamMapRenderer {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        repo: Arc<dyn PipelineRepository>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            config,
            repo,
            permissions,
        }
    }

    pub async fn render(&self, name: &str, counter: u32, user: &str) -> Result<ValueStreamMap> {
        let instance = self
            .repo
            .find_instance(name, counter)
            .await?
            .ok_or_else(|| Error::instance_not_found(name, counter))?;
        if !self.permissions.can_view(user, name).await {
            return Err(Error::Unauthorized(format!(
                "You do not have view permissions for pipeline '{}'.",
                name
            )));
        }
        let config = self.config.current_config().await?;

        let unsupported = || {
            Error::UnsupportedTopology(format!(
                "Value Stream Map of Pipeline '{}' with counter '{}' can not be rendered. \
                 Changes to the configuration have introduced complex dependencies for this \
                 instance which are not supported currently.",
                name, counter
            ))
        };
        if DependencyGraph::build(&config).ensure_acyclic_upstream(name).is_err() {
            return Err(unsupported());
        }

        let mut builder = MapBuilder::default();
        let anchor = builder.node(name, name, NodeKind::Pipeline);
        builder.nodes[anchor].add_revision(NodeRevision {
            revision: instance.counter.to_string(),
            label: Some(instance.label.clone()),
        });

        match self.add_upstream(&mut builder, name, instance.build_cause).await {
            Err(Error::UnsupportedTopology(_)) => return Err(unsupported()),
            other => other?,
        }
        self.add_downstream(&mut builder, &config, name, counter).await?;

        if builder.has_cycle() {
            debug!(pipeline = name, counter, "Value stream map is cyclic");
            return Err(unsupported());
        }
        builder.assign_levels(anchor).map_err(|_| unsupported())?;
        builder.insert_dummies();

        self.mark_nodes(&mut builder, &config, anchor, user).await;
        Ok(builder.finish(anchor))
    }

    async fn add_upstream(&self, builder: &mut MapBuilder, anchor: &str, cause: BuildCause) -> Result<()> {
        let mut expanded: HashSet<(String, u32)> = HashSet::new();
        let mut pending = VecDeque::from([(anchor.to_string(), cause, DescentPath::starting_at(anchor))]);

        while let Some((current, cause, path)) = pending.pop_front() {
            let child = builder.node(&current, &current, NodeKind::Pipeline);
            for revision in cause.material_revisions.iter() {
                match &revision.material {
                    Material::Dependency(dep) => {
                        let Some(upstream) = revision.dependency_revision() else {
                            continue;
                        };
                        if path.contains(&dep.pipeline) {
                            return Err(Error::UnsupportedTopology(format!(
                                "Cyclic dependency detected: {} -> {}",
                                path.describe(),
                                dep.pipeline
                            )));
                        }
                        let parent = builder.node(&dep.pipeline, &dep.pipeline, NodeKind::Pipeline);
                        builder.nodes[parent].add_revision(NodeRevision {
                            revision: upstream.counter.to_string(),
                            label: revision
                                .latest_modification()
                                .and_then(|m| m.pipeline_label.clone()),
                        });
                        builder.edge(parent, child);

                        if expanded.insert((upstream.pipeline.clone(), upstream.counter)) {
                            if let Some(instance) =
                                self.repo.find_instance(&upstream.pipeline, upstream.counter).await?
                            {
                                pending.push_back((
                                    dep.pipeline.clone(),
                                    instance.build_cause,
                                    path.with(dep.pipeline.clone()),
                                ));
                            }
                        }
                    }
                    Material::Scm(_) => {
                        let fingerprint = revision.fingerprint();
                        let parent =
                            builder.node(fingerprint.as_str(), revision.material.name(), NodeKind::Material);
                        if let Some(latest) = revision.latest_revision() {
                            builder.nodes[parent].add_revision(NodeRevision {
                                revision: latest.to_string(),
                                label: None,
                            });
                        }
                        builder.edge(parent, child);
                    }
                }
            }
        }
        Ok(())
    }

    async fn add_downstream(
        &self,
        builder: &mut MapBuilder,
        config: &ConfigSnapshot,
        anchor: &str,
        counter: u32,
    ) -> Result<()> {
        let mut counters: HashMap<String, BTreeSet<u32>> =
            HashMap::from([(anchor.to_string(), BTreeSet::from([counter]))]);
        let mut visited: HashSet<String> = HashSet::from([anchor.to_string()]);
        let mut pending = VecDeque::from([anchor.to_string()]);

        while let Some(upstream) = pending.pop_front() {
            let parent = builder.node(&upstream, &upstream, NodeKind::Pipeline);
            let upstream_counters = counters.get(&upstream).cloned().unwrap_or_default();

            for downstream in config.downstream_of(&upstream) {
                let child = builder.node(&downstream.name, &downstream.name, NodeKind::Pipeline);
                builder.edge(parent, child);

                for instance in self.repo.list_instances(&downstream.name).await? {
                    let built_from_map = instance.build_cause.material_revisions.iter().any(|r| {
                        r.dependency_revision().is_some_and(|dep| {
                            dep.pipeline == upstream && upstream_counters.contains(&dep.counter)
                        })
                    });
                    if built_from_map {
                        counters
                            .entry(downstream.name.clone())
                            .or_default()
                            .insert(instance.counter);
                        builder.nodes[child].add_revision(NodeRevision {
                            revision: instance.counter.to_string(),
                            label: Some(instance.label.clone()),
                        });
                    }
                }

                if visited.insert(downstream.name.clone()) {
                    pending.push_back(downstream.name.clone());
                }
            }
        }
        Ok(())
    }

    async fn mark_nodes(&self, builder: &mut MapBuilder, config: &ConfigSnapshot, anchor: usize, user: &str) {
        for (idx, node) in builder.nodes.iter_mut().enumerate() {
            if node.kind != NodeKind::Pipeline || idx == anchor {
                continue;
            }
            if !config.has_pipeline(&node.name) {
                node.revisions.clear();
                node.mark(ViewType::Deleted, format!("Pipeline '{}' has been deleted.", node.name));
            } else if !self.permissions.can_view(user, &node.name).await {
                node.revisions.clear();
                node.mark(
                    ViewType::NoPermission,
                    format!("You do not have view permissions for pipeline '{}'.", node.name),
                );
            }
        }

        let incompatible = builder
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::Material && n.revisions.len() > 1)
            .map(|n| n.name.clone());
        if let Some(material) = incompatible {
            builder.nodes[anchor].mark(
                ViewType::Warning,
                format!("This instance was built from incompatible revisions of material '{}'.", material),
            );
        }
    }
}
