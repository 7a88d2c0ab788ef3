//! Static permission and disk-space adapters.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ports::{DiskSpaceProbe, PermissionChecker};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allows everything except explicitly denied (user, pipeline) pairs.
#[derive(Debug, Default, Clone)]
pub struct StaticPermissions {
    view_denied: HashSet<(String, String)>,
    operate_denied: HashSet<(String, String)>,
}

impl StaticPermissions {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny_view(mut self, user: impl Into<String>, pipeline: impl Into<String>) -> Self {
        self.view_denied.insert((user.into(), pipeline.into()));
        self
    }

    pub fn deny_operate(mut self, user: impl Into<String>, pipeline: impl Into<String>) -> Self {
        self.operate_denied.insert((user.into(), pipeline.into()));
        self
    }

    fn denied(set: &HashSet<(String, String)>, user: &str, pipeline: &str) -> bool {
        set.contains(&(user.to_string(), pipeline.to_string()))
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn can_view(&self, user: &str, pipeline: &str) -> bool {
        !Self::denied(&self.view_denied, user, pipeline)
    }

    async fn can_operate(&self, user: &str, pipeline: &str) -> bool {
        !Self::denied(&self.operate_denied, user, pipeline)
            && !Self::denied(&self.view_denied, user, pipeline)
    }
}

/// Reports a settable amount of free space.
#[derive(Debug)]
pub struct StaticDiskSpace {
    available_mb: AtomicU64,
}

impl StaticDiskSpace {
    pub fn new(available_mb: u64) -> Self {
        Self {
            available_mb: AtomicU64::new(available_mb),
        }
    }

    pub fn set(&self, available_mb: u64) {
        self.available_mb.store(available_mb, Ordering::SeqCst);
    }
}

impl Default for StaticDiskSpace {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl DiskSpaceProbe for StaticDiskSpace {
    async fn available_mb(&self) -> Result<u64> {
        Ok(self.available_mb.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_view_implies_denied_operate() {
        let permissions = StaticPermissions::allow_all().deny_view("bob", "secret");
        assert!(!permissions.can_view("bob", "secret").await);
        assert!(!permissions.can_operate("bob", "secret").await);
        assert!(permissions.can_view("alice", "secret").await);
    }

    #[test]
    fn test_disk_space_is_settable() {
        let disk = StaticDiskSpace::new(2048);
        disk.set(10);
        assert_eq!(tokio_test::block_on(disk.available_mb()).unwrap(), 10);
        assert_eq!(tokio_test::block_on(StaticDiskSpace::default().available_mb()).unwrap(), u64::MAX);
    }
}
