//! Page cache.
//!
//! In-memory cache of decoded pages keyed by page index, holding the
//! committed image of every cached page plus a dirty flag. Eviction is
//! approximate LRU with a second-chance counter: plain `get` bumps an
//! atomic access counter without reordering, and the evictor walks from the
//! LRU end, sparing (and resetting) up to three recently-touched entries
//! before taking a victim.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::storage::page::Page;
use crate::types::PageId;

/// How many non-zero access counters the evictor resets before it stops
/// giving second chances.
const EVICT_SKIP_LIMIT: usize = 3;

/// Default cache capacity in pages (~4 MB of page data).
pub const DEFAULT_CACHE_PAGES: usize = 1000;

struct CacheEntry {
    page: Arc<Page>,
    dirty: bool,
    access: AtomicU32,
}

/// A page evicted while still dirty; the caller must write it back.
pub type DirtyEviction = (PageId, Arc<Page>);

/// Committed-page cache with approximate LRU eviction.
pub struct PageCache {
    capacity: usize,
    map: HashMap<PageId, CacheEntry>,
    /// Recency order: front = LRU, back = MRU.
    lru: VecDeque<PageId>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        PageCache {
            capacity,
            map: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up a page. A hit bumps the entry's access counter but does not
    /// reorder the LRU list.
    pub fn get(&self, id: PageId) -> Option<Arc<Page>> {
        let entry = self.map.get(&id)?;
        entry.access.fetch_add(1, Ordering::Relaxed);
        Some(entry.page.clone())
    }

    /// Look up a page and move it to the MRU end. Used for pages known to
    /// stay hot, such as the header page and index roots.
    pub fn get_and_promote(&mut self, id: PageId) -> Option<Arc<Page>> {
        if !self.map.contains_key(&id) {
            return None;
        }
        self.touch(id);
        let entry = self.map.get(&id)?;
        entry.access.fetch_add(1, Ordering::Relaxed);
        Some(entry.page.clone())
    }

    /// Insert or replace a page at the MRU end. When the cache is at
    /// capacity one victim is evicted first; a victim that is still dirty
    /// is returned so the caller can write it back.
    pub fn put(&mut self, id: PageId, page: Arc<Page>, dirty: bool) -> Option<DirtyEviction> {
        if self.capacity == 0 {
            // Caching disabled: hand straight back anything that must reach disk.
            return dirty.then_some((id, page));
        }

        if let Some(entry) = self.map.get_mut(&id) {
            entry.page = page;
            entry.dirty = entry.dirty || dirty;
            entry.access.store(0, Ordering::Relaxed);
            self.touch(id);
            return None;
        }

        let mut evicted = None;
        if self.map.len() >= self.capacity {
            evicted = self.evict_one();
        }
        self.map.insert(
            id,
            CacheEntry {
                page,
                dirty,
                access: AtomicU32::new(0),
            },
        );
        self.lru.push_back(id);
        evicted
    }

    /// Clear the dirty flag after the page has been flushed.
    pub fn mark_clean(&mut self, id: PageId) {
        if let Some(entry) = self.map.get_mut(&id) {
            entry.dirty = false;
        }
    }

    /// Snapshot of all dirty entries, in ascending page order.
    pub fn dirty_pages(&self) -> Vec<(PageId, Arc<Page>)> {
        let mut dirty: Vec<_> = self
            .map
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, e)| (*id, e.page.clone()))
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        dirty
    }

    /// Number of dirty entries.
    pub fn dirty_count(&self) -> usize {
        self.map.values().filter(|e| e.dirty).count()
    }

    /// Drop every entry. Dirty pages are returned for write-back.
    pub fn drain(&mut self) -> Vec<(PageId, Arc<Page>)> {
        let dirty = self.dirty_pages();
        self.map.clear();
        self.lru.clear();
        dirty
    }

    fn touch(&mut self, id: PageId) {
        if let Some(pos) = self.lru.iter().position(|&v| v == id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(id);
    }

    fn evict_one(&mut self) -> Option<DirtyEviction> {
        let mut skipped = 0usize;
        while let Some(id) = self.lru.pop_front() {
            let recently_used = self
                .map
                .get(&id)
                .map(|e| e.access.load(Ordering::Relaxed) != 0)
                .unwrap_or(false);
            if recently_used && skipped < EVICT_SKIP_LIMIT {
                // Second chance: reset the counter and recycle to the MRU end.
                if let Some(entry) = self.map.get(&id) {
                    entry.access.store(0, Ordering::Relaxed);
                }
                self.lru.push_back(id);
                skipped += 1;
                continue;
            }
            if let Some(entry) = self.map.remove(&id) {
                if entry.dirty {
                    debug!("evicting dirty page {}", id);
                    return Some((id, entry.page));
                }
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::FreePage;

    fn page(version: u32) -> Arc<Page> {
        Arc::new(Page::Free(FreePage { next: 0, version }))
    }

    #[test]
    fn test_capacity_bound_with_lru_order() {
        let mut cache = PageCache::new(2);
        assert!(cache.put(1, page(1), false).is_none());
        assert!(cache.put(2, page(2), false).is_none());
        assert_eq!(cache.len(), 2);

        // Page 1 is the LRU victim.
        cache.put(3, page(3), false);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_second_chance_spares_touched_entries() {
        let mut cache = PageCache::new(2);
        cache.put(1, page(1), false);
        cache.put(2, page(2), false);
        // Touch page 1 so its access counter is non-zero.
        assert!(cache.get(1).is_some());

        // Eviction skips page 1 (resetting it) and takes page 2 instead.
        cache.put(3, page(3), false);
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_promote_moves_to_mru() {
        let mut cache = PageCache::new(2);
        cache.put(1, page(1), false);
        cache.put(2, page(2), false);
        // get_and_promote resets nothing but reorders: page 1 becomes MRU,
        // so page 2 is the next victim once its counter is spent.
        assert!(cache.get_and_promote(1).is_some());
        cache.put(3, page(3), false);
        cache.put(4, page(4), false);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_dirty_eviction_is_returned() {
        let mut cache = PageCache::new(1);
        cache.put(1, page(1), true);
        let evicted = cache.put(2, page(2), false);
        match evicted {
            Some((1, p)) => assert_eq!(p.version(), 1),
            other => panic!("expected dirty eviction of page 1, got {:?}", other.map(|e| e.0)),
        }
    }

    #[test]
    fn test_put_replaces_and_keeps_dirty() {
        let mut cache = PageCache::new(4);
        cache.put(1, page(1), true);
        cache.put(1, page(2), false);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.get(1).unwrap().version(), 2);
        cache.mark_clean(1);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_dirty_pages_sorted() {
        let mut cache = PageCache::new(8);
        cache.put(5, page(5), true);
        cache.put(2, page(2), true);
        cache.put(3, page(3), false);
        let dirty: Vec<PageId> = cache.dirty_pages().into_iter().map(|(id, _)| id).collect();
        assert_eq!(dirty, vec![2, 5]);
    }
}
