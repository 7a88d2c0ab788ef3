//! In-memory implementation of PipelineRepository.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ids::{JobInstanceId, StageInstanceId};
use cadence_core::instance::PipelineInstance;
use cadence_core::ports::PipelineRepository;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Pipeline history keyed by name, then counter.
#[derive(Default)]
pub struct MemoryPipelineRepository {
    instances: RwLock<HashMap<String, BTreeMap<u32, PipelineInstance>>>,
}

impl MemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing history.
    pub async fn with_instances(instances: impl IntoIterator<Item = PipelineInstance>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.instances.write().await;
            for instance in instances {
                map.entry(instance.name.clone())
                    .or_default()
                    .insert(instance.counter, instance);
            }
        }
        repo
    }

    /// Number of stored instances across all pipelines.
    pub async fn len(&self) -> usize {
        self.instances.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored instance, grouped by pipeline name.
    pub async fn all(&self) -> Vec<PipelineInstance> {
        let map = self.instances.read().await;
        let mut names: Vec<&String> = map.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| map[name].values().cloned())
            .collect()
    }
}

#[async_trait]
impl PipelineRepository for MemoryPipelineRepository {
    async fn find_instance(&self, name: &str, counter: u32) -> Result<Option<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .get(name)
            .and_then(|runs| runs.get(&counter))
            .cloned())
    }

    async fn find_instance_by_label(
        &self,
        name: &str,
        label: &str,
    ) -> Result<Option<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .get(name)
            .and_then(|runs| runs.values().rev().find(|i| i.label == label))
            .cloned())
    }

    async fn most_recent(&self, name: &str) -> Result<Option<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .get(name)
            .and_then(|runs| runs.values().next_back())
            .cloned())
    }

    async fn list_instances(&self, name: &str) -> Result<Vec<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .get(name)
            .map(|runs| runs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_instance_by_stage(&self, id: StageInstanceId) -> Result<Option<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .flat_map(BTreeMap::values)
            .find(|i| i.stage_by_id(id).is_some())
            .cloned())
    }

    async fn find_instance_by_job(&self, id: JobInstanceId) -> Result<Option<PipelineInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .flat_map(BTreeMap::values)
            .find(|i| i.stage_with_job(id).is_some())
            .cloned())
    }

    async fn save_instances(&self, instances: &[PipelineInstance]) -> Result<()> {
        let mut map = self.instances.write().await;
        for instance in instances {
            debug!(pipeline = %instance.name, counter = instance.counter, "Saving pipeline instance");
            map.entry(instance.name.clone())
                .or_default()
                .insert(instance.counter, instance.clone());
        }
        Ok(())
    }
}
