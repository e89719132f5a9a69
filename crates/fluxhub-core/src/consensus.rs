//! Consensus-backed metadata store
//!
//! The election and failover machinery needs a small strongly-consistent
//! keyspace: the leader lease, a coarse election lock and the per-peer
//! recover offsets persisted by the primary. `ConsensusStore` is the
//! seam; `MemoryConsensus` is the in-process implementation used by
//! single-node deployments and tests. A store backed by an external
//! consensus service plugs in behind the same trait.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;

/// Key holding the serialized leader lease.
pub const LEASE_KEY: &str = "fluxhub/lease";

/// Mutual-exclusion lock taken around lease writes.
pub const LOCK_KEY: &str = "fluxhub/lock";

/// Key holding the persisted recover offset for one peer.
pub fn recover_offset_key(peer_id: &str) -> String {
    format!("fluxhub/recover/{}", peer_id)
}

/// Strongly-consistent key-value and lock operations. Every call may
/// fail transiently; callers retry on their own cadence.
pub trait ConsensusStore: Send + Sync + 'static {
    /// Read a key. `None` when the key does not exist.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key, overwriting any existing value.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Try to take the named lock for `holder`. Re-acquiring a lock
    /// already held by the same holder succeeds.
    fn try_lock(&self, key: &str, holder: &str) -> Result<bool>;

    /// Release the named lock if `holder` owns it. Returns whether the
    /// lock was actually released.
    fn unlock(&self, key: &str, holder: &str) -> Result<bool>;
}

/// In-process store. Linearizable trivially, durable not at all.
#[derive(Default)]
pub struct MemoryConsensus {
    kv: Mutex<HashMap<String, Vec<u8>>>,
    locks: Mutex<HashMap<String, String>>,
}

impl MemoryConsensus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsensusStore for MemoryConsensus {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.kv.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.kv.lock().remove(key);
        Ok(())
    }

    fn try_lock(&self, key: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(owner) => Ok(owner == holder),
            None => {
                locks.insert(key.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    fn unlock(&self, key: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|owner| owner == holder) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_roundtrip() {
        let store = MemoryConsensus::new();
        assert_eq!(store.read("k").unwrap(), None);
        store.write("k", b"v").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v".to_vec()));
        store.delete("k").unwrap();
        assert_eq!(store.read("k").unwrap(), None);
    }

    #[test]
    fn test_lock_mutual_exclusion() {
        let store = MemoryConsensus::new();
        assert!(store.try_lock(LOCK_KEY, "a").unwrap());
        assert!(!store.try_lock(LOCK_KEY, "b").unwrap());
        // Re-entrant for the same holder.
        assert!(store.try_lock(LOCK_KEY, "a").unwrap());
        assert!(!store.unlock(LOCK_KEY, "b").unwrap());
        assert!(store.unlock(LOCK_KEY, "a").unwrap());
        assert!(store.try_lock(LOCK_KEY, "b").unwrap());
    }
}
