//! Scheduling transactions and after-commit listeners.
//!
//! A [`Transaction`] stages instance writes, lock changes and events in
//! memory. Nothing is visible to other callers until [`Transaction::commit`]
//! saves every staged instance in one repository write and applies the lock
//! changes. Listeners only ever see events from committed transactions.
//! Dropping a transaction without committing discards it.

use crate::lock::LockTable;
use cadence_core::events::Event;
use cadence_core::ids::{JobInstanceId, StageInstanceId};
use cadence_core::instance::PipelineInstance;
use cadence_core::ports::{EventListener, PipelineRepository};
use cadence_core::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Ordered set of after-commit listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, listener: Arc<dyn EventListener>) {
        debug!(listener = listener.name(), "Registering event listener");
        self.listeners.write().await.push(listener);
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Deliver `events` to every listener in registration order.
    ///
    /// A listener that fails or panics is logged and skipped.
    pub async fn notify(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().await.clone();
        for event in events {
            for listener in &listeners {
                match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        listener = listener.name(),
                        subject = %event.subject(),
                        error = %e,
                        "Event listener failed"
                    ),
                    Err(_) => warn!(
                        listener = listener.name(),
                        subject = %event.subject(),
                        "Event listener panicked"
                    ),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockChange {
    Lock(String, u32),
    Unlock(String),
}

/// Opens transactions against one repository and lock table.
pub struct TransactionCoordinator {
    repo: Arc<dyn PipelineRepository>,
    locks: Arc<RwLock<LockTable>>,
    listeners: Arc<ListenerRegistry>,
}

impl TransactionCoordinator {
    pub fn new(
        repo: Arc<dyn PipelineRepository>,
        locks: Arc<RwLock<LockTable>>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            repo,
            locks,
            listeners,
        }
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            coordinator: self,
            staged: Vec::new(),
            lock_changes: Vec::new(),
            events: Vec::new(),
            committed: false,
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn repository(&self) -> &Arc<dyn PipelineRepository> {
        &self.repo
    }
}

/// One unit of scheduling work.
pub struct Transaction<'a> {
    coordinator: &'a TransactionCoordinator,
    staged: Vec<PipelineInstance>,
    lock_changes: Vec<LockChange>,
    events: Vec<Event>,
    committed: bool,
}

impl Transaction<'_> {
    fn staged_instance(&self, name: &str, counter: u32) -> Option<&PipelineInstance> {
        self.staged
            .iter()
            .find(|i| i.name == name && i.counter == counter)
    }

    pub async fn find_instance(&self, name: &str, counter: u32) -> Result<Option<PipelineInstance>> {
        if let Some(instance) = self.staged_instance(name, counter) {
            return Ok(Some(instance.clone()));
        }
        self.coordinator.repo.find_instance(name, counter).await
    }

    pub async fn find_instance_by_stage(&self, id: StageInstanceId) -> Result<Option<PipelineInstance>> {
        if let Some(instance) = self.staged.iter().find(|i| i.stage_by_id(id).is_some()) {
            return Ok(Some(instance.clone()));
        }
        let found = self.coordinator.repo.find_instance_by_stage(id).await?;
        Ok(found.map(|i| self.overlay(i)))
    }

    pub async fn find_instance_by_job(&self, id: JobInstanceId) -> Result<Option<PipelineInstance>> {
        if let Some(instance) = self.staged.iter().find(|i| i.stage_with_job(id).is_some()) {
            return Ok(Some(instance.clone()));
        }
        let found = self.coordinator.repo.find_instance_by_job(id).await?;
        Ok(found.map(|i| self.overlay(i)))
    }

    pub async fn most_recent(&self, name: &str) -> Result<Option<PipelineInstance>> {
        let stored = self.coordinator.repo.most_recent(name).await?;
        let staged = self
            .staged
            .iter()
            .filter(|i| i.name == name)
            .max_by_key(|i| i.counter);
        Ok(match (stored, staged) {
            (Some(stored), Some(staged)) if stored.counter > staged.counter => Some(stored),
            (_, Some(staged)) => Some(staged.clone()),
            (stored, None) => stored,
        })
    }

    /// Every instance of `name`, lowest counter first, staged writes included.
    pub async fn list_instances(&self, name: &str) -> Result<Vec<PipelineInstance>> {
        let mut instances: Vec<PipelineInstance> = self
            .coordinator
            .repo
            .list_instances(name)
            .await?
            .into_iter()
            .map(|i| self.overlay(i))
            .collect();
        for staged in self.staged.iter().filter(|i| i.name == name) {
            if !instances.iter().any(|i| i.counter == staged.counter) {
                instances.push(staged.clone());
            }
        }
        instances.sort_by_key(|i| i.counter);
        Ok(instances)
    }

    fn overlay(&self, stored: PipelineInstance) -> PipelineInstance {
        self.staged_instance(&stored.name, stored.counter)
            .cloned()
            .unwrap_or(stored)
    }

    /// Stage a write of `instance`, replacing an earlier staged copy.
    pub fn stage(&mut self, instance: PipelineInstance) {
        match self
            .staged
            .iter_mut()
            .find(|i| i.name == instance.name && i.counter == instance.counter)
        {
            Some(existing) => *existing = instance,
            None => self.staged.push(instance),
        }
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        self.lock_holder(name).await.is_some()
    }

    /// Lock holder as it will be after this transaction commits.
    pub async fn lock_holder(&self, name: &str) -> Option<u32> {
        let mut holder = self.coordinator.locks.read().await.lock_holder(name);
        for change in &self.lock_changes {
            match change {
                LockChange::Lock(n, counter) if n == name => holder = holder.or(Some(*counter)),
                LockChange::Unlock(n) if n == name => holder = None,
                _ => {}
            }
        }
        holder
    }

    pub fn lock(&mut self, name: &str, counter: u32) {
        self.lock_changes.push(LockChange::Lock(name.to_string(), counter));
    }

    pub fn unlock(&mut self, name: &str) {
        self.lock_changes.push(LockChange::Unlock(name.to_string()));
    }

    pub fn publish(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Persist staged instances, apply lock changes, then notify listeners.
    pub async fn commit(mut self) -> Result<()> {
        if !self.staged.is_empty() {
            self.coordinator.repo.save_instances(&self.staged).await?;
        }
        if !self.lock_changes.is_empty() {
            let mut locks = self.coordinator.locks.write().await;
            for change in &self.lock_changes {
                match change {
                    LockChange::Lock(name, counter) => {
                        if locks.lock(name, *counter) {
                            info!(pipeline = %name, counter, "Pipeline locked");
                        } else {
                            warn!(pipeline = %name, counter, "Pipeline already locked by another instance");
                        }
                    }
                    LockChange::Unlock(name) => {
                        if let Some(counter) = locks.unlock(name) {
                            info!(pipeline = %name, counter, "Pipeline unlocked");
                        }
                    }
                }
            }
        }
        self.committed = true;

        let events = std::mem::take(&mut self.events);
        self.coordinator.listeners.notify(&events).await;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && (!self.staged.is_empty() || !self.events.is_empty()) {
            debug!(
                instances = self.staged.len(),
                events = self.events.len(),
                "Transaction rolled back"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::build_cause::BuildCause;
    use cadence_core::events::PipelineLockPayload;
    use cadence_core::Error;
    use cadence_store::MemoryPipelineRepository;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_event(&self, _event: &Event) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &Event) -> Result<()> {
            Err(Error::Internal("listener down".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_event(&self, _event: &Event) -> Result<()> {
            panic!("listener bug")
        }
    }

    fn unlocked(name: &str) -> Event {
        Event::PipelineUnlocked(PipelineLockPayload {
            pipeline_name: name.to_string(),
            counter: 1,
            timestamp: Utc::now(),
        })
    }

    fn coordinator() -> (TransactionCoordinator, Arc<MemoryPipelineRepository>) {
        let repo = Arc::new(MemoryPipelineRepository::new());
        let coordinator = TransactionCoordinator::new(
            repo.clone(),
            Arc::new(RwLock::new(LockTable::new())),
            Arc::new(ListenerRegistry::new()),
        );
        (coordinator, repo)
    }

    fn instance(counter: u32) -> PipelineInstance {
        PipelineInstance::new("cruise", counter, counter.to_string(), BuildCause::empty(), vec![])
    }

    #[tokio::test]
    async fn test_rollback_fires_nothing() {
        let (coordinator, repo) = coordinator();
        let counting = Arc::new(Counting { seen: AtomicUsize::new(0) });
        coordinator.listeners().register(counting.clone()).await;

        {
            let mut tx = coordinator.begin();
            tx.stage(instance(1));
            tx.lock("cruise", 1);
            tx.publish(unlocked("cruise"));
            assert!(tx.is_locked("cruise").await);
            assert!(tx.find_instance("cruise", 1).await.unwrap().is_some());
        }

        assert_eq!(counting.seen.load(Ordering::SeqCst), 0);
        assert!(repo.is_empty().await);
        assert!(!coordinator.begin().is_locked("cruise").await);
    }

    #[tokio::test]
    async fn test_commit_persists_then_notifies() {
        let (coordinator, repo) = coordinator();
        let counting = Arc::new(Counting { seen: AtomicUsize::new(0) });
        coordinator.listeners().register(Arc::new(Failing)).await;
        coordinator.listeners().register(Arc::new(Panicking)).await;
        coordinator.listeners().register(counting.clone()).await;

        let mut tx = coordinator.begin();
        tx.stage(instance(1));
        tx.stage(instance(2));
        tx.lock("cruise", 2);
        tx.publish(unlocked("cruise"));
        tx.publish(unlocked("cruise"));
        tx.commit().await.unwrap();

        assert_eq!(repo.len().await, 2);
        assert_eq!(counting.seen.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.begin().lock_holder("cruise").await, Some(2));
    }

    #[tokio::test]
    async fn test_reads_see_staged_writes() {
        let (coordinator, repo) = coordinator();
        repo.save_instance(&instance(1)).await.unwrap();

        let mut tx = coordinator.begin();
        let mut relabelled = instance(1);
        relabelled.label = "relabelled".to_string();
        tx.stage(relabelled);
        tx.stage(instance(2));

        assert_eq!(tx.most_recent("cruise").await.unwrap().map(|i| i.counter), Some(2));
        let listed = tx.list_instances("cruise").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].label, "relabelled");

        tx.unlock("cruise");
        assert!(!tx.is_locked("cruise").await);
    }
}
