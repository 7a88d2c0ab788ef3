//! In-memory configuration source.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::pipeline::ConfigSnapshot;
use cadence_core::ports::ConfigSource;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Holds the current snapshot; edits swap in a whole new one.
pub struct MemoryConfigSource {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl MemoryConfigSource {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Replace the configuration. Snapshots already handed out are unaffected.
    pub async fn replace(&self, snapshot: ConfigSnapshot) {
        info!(pipelines = snapshot.pipelines.len(), "Configuration replaced");
        *self.current.write().await = Arc::new(snapshot);
    }
}

impl Default for MemoryConfigSource {
    fn default() -> Self {
        Self::new(ConfigSnapshot::default())
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn current_config(&self) -> Result<Arc<ConfigSnapshot>> {
        Ok(self.current.read().await.clone())
    }
}
