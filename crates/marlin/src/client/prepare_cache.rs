//! Server-prepared statement cache.
//!
//! LRU keyed by SQL text. Entries are reference-counted by live statement
//! handles; an entry evicted while still referenced is closed only when its
//! last handle drops (evict-then-close).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::message::server::ColumnDefinition;

/// Result of a COM_STMT_PREPARE, shared by the cache and statement handles.
#[derive(Debug)]
pub struct PrepareResult {
    pub statement_id: u32,
    pub num_params: u16,
    pub columns: Vec<ColumnDefinition>,
    /// Live statement handles using this prepare.
    use_count: AtomicU32,
    /// Still present in the cache.
    cached: AtomicBool,
}

impl PrepareResult {
    pub fn new(statement_id: u32, num_params: u16, columns: Vec<ColumnDefinition>) -> Arc<Self> {
        Arc::new(Self {
            statement_id,
            num_params,
            columns,
            use_count: AtomicU32::new(1),
            cached: AtomicBool::new(false),
        })
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    fn increment_use(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one handle. Returns true when the statement must be closed on
    /// the server now: no handles remain and the cache no longer holds it.
    pub fn decrement_use(&self) -> bool {
        let remaining = self.use_count.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining == 0 && !self.is_cached()
    }
}

#[derive(Debug)]
struct Entry {
    prepare: Arc<PrepareResult>,
    last_used: Instant,
}

#[derive(Debug)]
pub struct PrepareCache {
    entries: HashMap<String, Entry>,
    capacity: usize,
}

impl PrepareCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a prepared statement, taking a new handle on it.
    pub fn get(&mut self, sql: &str) -> Option<Arc<PrepareResult>> {
        let entry = self.entries.get_mut(sql)?;
        entry.last_used = Instant::now();
        entry.prepare.increment_use();
        Some(entry.prepare.clone())
    }

    /// Insert a freshly-prepared statement. If the SQL is already cached the
    /// existing entry wins and is returned; the caller must close its own
    /// prepare. Returns `(winner, statement_ids_to_close)`.
    pub fn put(
        &mut self,
        sql: &str,
        prepare: Arc<PrepareResult>,
    ) -> (Arc<PrepareResult>, Vec<u32>) {
        if let Some(existing) = self.entries.get_mut(sql) {
            existing.last_used = Instant::now();
            existing.prepare.increment_use();
            let loser = if prepare.decrement_use() {
                vec![prepare.statement_id]
            } else {
                Vec::new()
            };
            return (existing.prepare.clone(), loser);
        }

        let mut to_close = Vec::new();
        if self.capacity == 0 {
            return (prepare, to_close);
        }
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.evict_lru() {
                // Deferred close: a still-referenced evictee is closed by its
                // last handle drop instead.
                if evicted.use_count() == 0 {
                    to_close.push(evicted.statement_id);
                }
            }
        }

        prepare.cached.store(true, Ordering::Release);
        self.entries.insert(
            sql.to_owned(),
            Entry {
                prepare: prepare.clone(),
                last_used: Instant::now(),
            },
        );
        (prepare, to_close)
    }

    fn evict_lru(&mut self) -> Option<Arc<PrepareResult>> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())?;
        let entry = self.entries.remove(&key)?;
        entry.prepare.cached.store(false, Ordering::Release);
        Some(entry.prepare)
    }

    /// Drop every entry, returning the statement ids that need a server-side
    /// close (those with no live handles).
    pub fn reset(&mut self) -> Vec<u32> {
        let mut to_close = Vec::new();
        for (_, entry) in self.entries.drain() {
            entry.prepare.cached.store(false, Ordering::Release);
            if entry.prepare.use_count() == 0 {
                to_close.push(entry.prepare.statement_id);
            }
        }
        to_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prep(id: u32) -> Arc<PrepareResult> {
        PrepareResult::new(id, 0, Vec::new())
    }

    #[test]
    fn get_increments_use_count() {
        let mut cache = PrepareCache::new(4);
        let (winner, closes) = cache.put("SELECT 1", prep(1));
        assert!(closes.is_empty());
        assert_eq!(winner.use_count(), 1);

        let again = cache.get("SELECT 1").unwrap();
        assert_eq!(again.use_count(), 2);
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn ref_count_law() {
        // sum(use_count) equals the number of live handles.
        let mut cache = PrepareCache::new(4);
        let (h1, _) = cache.put("q", prep(7));
        let h2 = cache.get("q").unwrap();
        assert_eq!(h1.use_count(), 2);

        assert!(!h2.decrement_use()); // still cached, one handle left
        assert!(!h1.decrement_use()); // still cached, zero handles
        assert_eq!(h1.use_count(), 0);
        assert!(h1.is_cached());
    }

    #[test]
    fn losing_racer_is_closed() {
        let mut cache = PrepareCache::new(4);
        let (first, _) = cache.put("q", prep(1));
        let loser = prep(2);
        let (winner, closes) = cache.put("q", loser);
        assert_eq!(winner.statement_id, 1);
        assert_eq!(closes, vec![2]);
        assert_eq!(first.use_count(), 2);
    }

    #[test]
    fn eviction_closes_unreferenced_lru() {
        let mut cache = PrepareCache::new(2);
        let (a, _) = cache.put("a", prep(1));
        a.decrement_use(); // no live handles on "a"
        std::thread::sleep(std::time::Duration::from_millis(2));
        let (_b, _) = cache.put("b", prep(2));
        std::thread::sleep(std::time::Duration::from_millis(2));

        let (_c, closes) = cache.put("c", prep(3));
        // "a" was LRU with zero handles: closed eagerly.
        assert_eq!(closes, vec![1]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_defers_close_of_referenced_entry() {
        let mut cache = PrepareCache::new(1);
        let (a, _) = cache.put("a", prep(1));
        let (_b, closes) = cache.put("b", prep(2));
        // "a" evicted but referenced: nothing to close yet.
        assert!(closes.is_empty());
        assert!(!a.is_cached());
        // Exactly one close is dispatched, by the final handle.
        assert!(a.decrement_use());
    }

    #[test]
    fn reset_reports_unreferenced_ids() {
        let mut cache = PrepareCache::new(4);
        let (a, _) = cache.put("a", prep(1));
        let (_b, _) = cache.put("b", prep(2));
        a.decrement_use();

        let mut ids = cache.reset();
        ids.sort_unstable();
        assert_eq!(ids, vec![1]);
        assert!(cache.is_empty());
    }
}
