//! Materials, modifications and material revisions.
//!
//! A material is identified by its [`Fingerprint`], a stable hash of the
//! attributes that define it. Two materials with the same fingerprint are
//! the same material no matter which pipeline config declares them or what
//! local name they carry.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Stable identity key for a material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn from_attributes(attributes: &[(&str, &str)]) -> Self {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"<|>");
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScmKind {
    Git,
    Hg,
    Svn,
    Perforce,
    Tfs,
}

impl ScmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScmKind::Git => "git",
            ScmKind::Hg => "hg",
            ScmKind::Svn => "svn",
            ScmKind::Perforce => "perforce",
            ScmKind::Tfs => "tfs",
        }
    }
}

/// A version-control repository, optionally checked out into a sub-folder.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScmMaterial {
    pub kind: ScmKind,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Local checkout folder. Part of the identity.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ScmMaterial {
    pub fn new(kind: ScmKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            branch: None,
            folder: None,
            name: None,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A dependency on a stage of an upstream pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DependencyMaterial {
    pub pipeline: String,
    pub stage: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl DependencyMaterial {
    pub fn new(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            name: None,
        }
    }
}

/// A configured change source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Material {
    Scm(ScmMaterial),
    Dependency(DependencyMaterial),
}

impl Material {
    pub fn scm(kind: ScmKind, url: impl Into<String>) -> Self {
        Material::Scm(ScmMaterial::new(kind, url))
    }

    pub fn git(url: impl Into<String>) -> Self {
        Self::scm(ScmKind::Git, url)
    }

    pub fn hg(url: impl Into<String>) -> Self {
        Self::scm(ScmKind::Hg, url)
    }

    pub fn svn(url: impl Into<String>) -> Self {
        Self::scm(ScmKind::Svn, url)
    }

    pub fn dependency(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Material::Dependency(DependencyMaterial::new(pipeline, stage))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Material::Scm(scm) => Fingerprint::from_attributes(&[
                ("kind", scm.kind.as_str()),
                ("url", &scm.url),
                ("branch", scm.branch.as_deref().unwrap_or("")),
                ("folder", scm.folder.as_deref().unwrap_or("")),
            ]),
            Material::Dependency(dep) => Fingerprint::from_attributes(&[
                ("kind", "dependency"),
                ("pipeline", &dep.pipeline),
                ("stage", &dep.stage),
            ]),
        }
    }

    /// Name used in labels and displays.
    pub fn name(&self) -> &str {
        match self {
            Material::Scm(scm) => scm.name.as_deref().unwrap_or(&scm.url),
            Material::Dependency(dep) => dep.name.as_deref().unwrap_or(&dep.pipeline),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Material::Scm(scm) => scm.kind.as_str(),
            Material::Dependency(_) => "pipeline",
        }
    }

    pub fn as_dependency(&self) -> Option<&DependencyMaterial> {
        match self {
            Material::Dependency(dep) => Some(dep),
            Material::Scm(_) => None,
        }
    }

    pub fn is_dependency(&self) -> bool {
        self.as_dependency().is_some()
    }
}

impl PartialEq for Material {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for Material {}

impl Hash for Material {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint().hash(state);
    }
}

/// Parsed form of a dependency material revision: `pipeline/counter/stage/stageCounter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyRevision {
    pub pipeline: String,
    pub counter: u32,
    pub stage: String,
    pub stage_counter: u32,
}

impl DependencyRevision {
    pub fn new(
        pipeline: impl Into<String>,
        counter: u32,
        stage: impl Into<String>,
        stage_counter: u32,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            counter,
            stage: stage.into(),
            stage_counter,
        }
    }

    pub fn parse(revision: &str) -> Result<Self> {
        let parts: Vec<&str> = revision.split('/').collect();
        let invalid = || Error::InvalidRequest(format!("Invalid dependency revision '{}'", revision));
        if parts.len() != 4 {
            return Err(invalid());
        }
        Ok(Self {
            pipeline: parts[0].to_string(),
            counter: parts[1].parse().map_err(|_| invalid())?,
            stage: parts[2].to_string(),
            stage_counter: parts[3].parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for DependencyRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline, self.counter, self.stage, self.stage_counter
        )
    }
}

/// An immutable fact that a material advanced to a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Modification {
    pub revision: String,
    pub modified_time: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Label of the upstream instance, for dependency revisions.
    #[serde(default)]
    pub pipeline_label: Option<String>,
}

impl Modification {
    pub fn new(revision: impl Into<String>, modified_time: DateTime<Utc>) -> Self {
        Self {
            revision: revision.into(),
            modified_time,
            user: None,
            comment: None,
            pipeline_label: None,
        }
    }

    pub fn dependency(
        revision: &DependencyRevision,
        label: impl Into<String>,
        modified_time: DateTime<Utc>,
    ) -> Self {
        Self {
            revision: revision.to_string(),
            modified_time,
            user: None,
            comment: None,
            pipeline_label: Some(label.into()),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A material together with the modifications chosen for a build, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MaterialRevision {
    pub material: Material,
    pub modifications: Vec<Modification>,
    #[serde(default)]
    pub changed: bool,
}

impl MaterialRevision {
    /// `modifications` must already be ordered newest first.
    pub fn new(material: Material, modifications: Vec<Modification>) -> Self {
        Self {
            material,
            modifications,
            changed: false,
        }
    }

    pub fn mark_changed(mut self) -> Self {
        self.changed = true;
        self
    }

    pub fn mark_unchanged(mut self) -> Self {
        self.changed = false;
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.material.fingerprint()
    }

    pub fn latest_modification(&self) -> Option<&Modification> {
        self.modifications.first()
    }

    pub fn latest_revision(&self) -> Option<&str> {
        self.latest_modification().map(|m| m.revision.as_str())
    }

    /// The upstream run this revision points at, for dependency materials.
    pub fn dependency_revision(&self) -> Option<DependencyRevision> {
        if !self.material.is_dependency() {
            return None;
        }
        self.latest_revision()
            .and_then(|rev| DependencyRevision::parse(rev).ok())
    }

    pub fn has_same_revision(&self, other: &MaterialRevision) -> bool {
        self.latest_revision() == other.latest_revision()
    }

    /// Whether this revision differs from the one a previous build used.
    pub fn has_changed_since(&self, previous: Option<&MaterialRevision>) -> bool {
        previous.is_none_or(|p| !self.has_same_revision(p))
    }
}

/// Ordered material revisions of one build, in config declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MaterialRevisions(Vec<MaterialRevision>);

impl MaterialRevisions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, revision: MaterialRevision) {
        self.0.push(revision);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MaterialRevision> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MaterialRevision> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MaterialRevision> {
        self.0.get(index)
    }

    pub fn find(&self, fingerprint: &Fingerprint) -> Option<&MaterialRevision> {
        self.0.iter().find(|r| &r.fingerprint() == fingerprint)
    }

    pub fn find_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut MaterialRevision> {
        self.0.iter_mut().find(|r| &r.fingerprint() == fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.find(fingerprint).is_some()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.0.iter().map(MaterialRevision::fingerprint).collect()
    }

    /// Sum of modification counts across every entry.
    pub fn total_modifications(&self) -> usize {
        self.0.iter().map(|r| r.modifications.len()).sum()
    }

    pub fn has_changed(&self) -> bool {
        self.0.iter().any(|r| r.changed)
    }

    /// True when both sets hold the same latest revision for every fingerprint.
    pub fn is_same_as(&self, other: &MaterialRevisions) -> bool {
        self.len() == other.len()
            && self.0.iter().all(|rev| {
                other
                    .find(&rev.fingerprint())
                    .is_some_and(|o| o.has_same_revision(rev))
            })
    }

    pub fn has_changed_since(&self, previous: &MaterialRevisions) -> bool {
        self.0
            .iter()
            .any(|r| r.has_changed_since(previous.find(&r.fingerprint())))
    }

    /// Recomputes every `changed` flag against the revisions of the last
    /// build. Without a previous build everything counts as changed.
    pub fn mark_changes_since(&mut self, previous: Option<&MaterialRevisions>) {
        for revision in self.0.iter_mut() {
            let before = previous.and_then(|p| p.find(&revision.fingerprint()));
            revision.changed = previous.is_none() || revision.has_changed_since(before);
        }
    }

    /// Latest revision per fingerprint, in order.
    pub fn revision_summary(&self) -> Vec<(Fingerprint, Option<String>)> {
        self.0
            .iter()
            .map(|r| (r.fingerprint(), r.latest_revision().map(str::to_string)))
            .collect()
    }
}

impl From<Vec<MaterialRevision>> for MaterialRevisions {
    fn from(revisions: Vec<MaterialRevision>) -> Self {
        Self(revisions)
    }
}

impl FromIterator<MaterialRevision> for MaterialRevisions {
    fn from_iter<I: IntoIterator<Item = MaterialRevision>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for MaterialRevisions {
    type Item = MaterialRevision;
    type IntoIter = std::vec::IntoIter<MaterialRevision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MaterialRevisions {
    type Item = &'a MaterialRevision;
    type IntoIter = std::slice::Iter<'a, MaterialRevision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
