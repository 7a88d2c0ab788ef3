//! Pipeline lock table.

use std::collections::HashMap;

/// Which instance currently holds each locked pipeline.
#[derive(Debug, Default)]
pub struct LockTable {
    holders: HashMap<String, u32>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.holders.contains_key(name)
    }

    /// Counter of the instance holding the lock.
    pub fn lock_holder(&self, name: &str) -> Option<u32> {
        self.holders.get(name).copied()
    }

    /// Take the lock for `counter`. Re-locking by the holder succeeds.
    pub fn lock(&mut self, name: &str, counter: u32) -> bool {
        match self.holders.get(name) {
            Some(holder) => *holder == counter,
            None => {
                self.holders.insert(name.to_string(), counter);
                true
            }
        }
    }

    pub fn unlock(&mut self, name: &str) -> Option<u32> {
        self.holders.remove(name)
    }

    pub fn is_locked_by(&self, name: &str, counter: u32) -> bool {
        self.lock_holder(name) == Some(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_per_pipeline() {
        let mut locks = LockTable::new();
        assert!(!locks.is_locked("cruise"));

        assert!(locks.lock("cruise", 3));
        assert!(locks.lock("cruise", 3));
        assert!(!locks.lock("cruise", 4));
        assert!(locks.lock("mingle", 4));
        assert!(locks.is_locked_by("cruise", 3));

        assert_eq!(locks.unlock("cruise"), Some(3));
        assert!(!locks.is_locked("cruise"));
        assert!(locks.is_locked("mingle"));
    }
}
