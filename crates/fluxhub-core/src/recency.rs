//! Recency cache - bounded LRU map from key to the most-recently-accepted
//! write, used to discard stale writes and to avoid reflecting a server's
//! own writes back to itself.
//!
//! The writer owns one instance to dedupe before commit; every sender owns
//! a private instance reflecting its peer's view of the stream.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::binlog::{BinlogReader, ReadOutcome};
use crate::error::Result;

/// Origin and recency stamp of the last accepted write for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyEntry {
    /// Cluster that originated the write
    pub origin_id: i32,
    /// Recency stamp of the write
    pub logical_time: i32,
}

/// Bounded last-write-wins dedup cache, unit weight 1 per key.
pub struct RecencyCache {
    map: Mutex<LruCache<Vec<u8>, RecencyEntry>>,
}

impl RecencyCache {
    /// Create a cache holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            map: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Atomic compare-and-set: accept the candidate iff no entry exists for
    /// the key or the candidate's `logical_time` is strictly newer. On
    /// accept the entry is replaced. Returns whether the candidate is
    /// considered freshest.
    pub fn check_and_update(&self, key: &[u8], origin_id: i32, logical_time: i32) -> bool {
        let mut map = self.map.lock();
        if let Some(entry) = map.get(key) {
            if logical_time <= entry.logical_time {
                return false;
            }
        }
        map.put(
            key.to_vec(),
            RecencyEntry {
                origin_id,
                logical_time,
            },
        );
        true
    }

    /// Current recency entry for a key, without promoting it.
    pub fn peek(&self, key: &[u8]) -> Option<RecencyEntry> {
        self.map.lock().peek(key).copied()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Drop every entry. Used on demotion together with the log reset.
    pub fn clear(&self) {
        self.map.lock().clear();
    }

    /// Rebuild the cache after a restart by replaying every retained
    /// record through `check_and_update`. Already-superseded entries are
    /// silently ignored. The reader must be in exit-at-end mode. Returns
    /// the number of records replayed.
    pub fn recover(&self, reader: &mut BinlogReader) -> Result<u64> {
        let mut replayed = 0u64;
        loop {
            match reader.read_next()? {
                ReadOutcome::Record(record) => {
                    self.check_and_update(&record.key, record.origin_id, record.logical_time);
                    replayed += 1;
                }
                ReadOutcome::EndOfLog | ReadOutcome::Stopped => break,
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_first_write() {
        let cache = RecencyCache::new(16);
        assert!(cache.check_and_update(b"k", 1, 10));
        assert_eq!(
            cache.peek(b"k"),
            Some(RecencyEntry {
                origin_id: 1,
                logical_time: 10
            })
        );
    }

    #[test]
    fn test_reject_stale_and_equal() {
        let cache = RecencyCache::new(16);
        assert!(cache.check_and_update(b"k", 1, 10));
        // Identical stamp: idempotent, second application rejects.
        assert!(!cache.check_and_update(b"k", 1, 10));
        // Strictly older rejects and leaves the entry untouched.
        assert!(!cache.check_and_update(b"k", 2, 9));
        assert_eq!(cache.peek(b"k").unwrap().origin_id, 1);
    }

    #[test]
    fn test_strictly_newer_always_accepts() {
        let cache = RecencyCache::new(16);
        for t in 1..20 {
            assert!(cache.check_and_update(b"k", t % 3, t));
        }
        assert_eq!(cache.peek(b"k").unwrap().logical_time, 19);
    }

    #[test]
    fn test_bounded_eviction() {
        let cache = RecencyCache::new(2);
        assert!(cache.check_and_update(b"a", 1, 1));
        assert!(cache.check_and_update(b"b", 1, 1));
        assert!(cache.check_and_update(b"c", 1, 1));
        assert_eq!(cache.len(), 2);
        // "a" was least recently used and fell out; a stale write for it
        // is accepted again.
        assert!(cache.check_and_update(b"a", 1, 1));
    }

    #[test]
    fn test_clear() {
        let cache = RecencyCache::new(16);
        cache.check_and_update(b"k", 1, 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
