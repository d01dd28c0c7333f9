//! Transaction manager.
//!
//! Transactions are optimistic: execution never blocks other transactions.
//! Reads record the version of every page they observe; writes are
//! copy-on-write into a private working set, with the committed image
//! snapshotted as a journal pre-image on first touch. COMMIT takes the
//! process-wide commit lock, validates every recorded read version against
//! the committed state, journals the pre-images, flushes the working set,
//! releases the journal and finally publishes any DDL effects to the
//! in-memory catalog. ROLLBACK is a pure drop: nothing has left the
//! transaction yet.
//!
//! Page allocation and the free list live here too: both mutate the
//! header page, so doing them through the transaction makes allocation
//! roll back with everything else.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::api::config::Config;
use crate::error::{Error, Result};
use crate::schema::{Catalog, DdlOp, TableSchema};
use crate::storage::journal;
use crate::storage::page::{DbHeader, FreePage, Page};
use crate::storage::pager::Pager;
use crate::storage::pcache::PageCache;
use crate::storage::PageStore;
use crate::types::{CancelToken, PageId, TxnId};

/// Shared engine state behind every connection: the paged file, the page
/// cache of committed images, the catalog, and the commit lock.
pub struct DbShared {
    pub(crate) path: PathBuf,
    pub(crate) config: Config,
    pub(crate) pager: Mutex<Pager>,
    pub(crate) cache: Mutex<PageCache>,
    pub(crate) catalog: RwLock<Catalog>,
    commit_lock: Mutex<()>,
    next_txn_id: AtomicU64,
}

/// Lock a mutex, recovering the guard if a writer panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DbShared {
    pub(crate) fn new(path: PathBuf, config: Config, pager: Pager, catalog: Catalog) -> Self {
        let cache = PageCache::new(config.max_cached_pages);
        DbShared {
            path,
            config,
            pager: Mutex::new(pager),
            cache: Mutex::new(cache),
            catalog: RwLock::new(catalog),
            commit_lock: Mutex::new(()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// The committed image of a page, via the cache. The header page is
    /// promoted on every hit; everything else only bumps its second-chance
    /// counter.
    pub(crate) fn committed_page(&self, id: PageId) -> Result<Arc<Page>> {
        let mut cache = lock(&self.cache);
        let hit = if id == 0 {
            cache.get_and_promote(id)
        } else {
            cache.get(id)
        };
        if let Some(page) = hit {
            return Ok(page);
        }
        let bytes = lock(&self.pager).read_page(id)?;
        let page = Arc::new(Page::decode(id, &bytes)?);
        if let Some((evicted_id, evicted)) = cache.put(id, page.clone(), false) {
            let bytes = evicted.encode(evicted_id)?;
            lock(&self.pager).write_page(evicted_id, &bytes)?;
        }
        Ok(page)
    }

    /// Write every dirty cached page to disk, sync, and mark them clean.
    pub(crate) fn flush_dirty(&self) -> Result<()> {
        let dirty = lock(&self.cache).dirty_pages();
        if dirty.is_empty() {
            return Ok(());
        }
        {
            let mut pager = lock(&self.pager);
            for (id, page) in &dirty {
                let bytes = page.encode(*id)?;
                pager.write_page(*id, &bytes)?;
            }
            pager.sync()?;
        }
        let mut cache = lock(&self.cache);
        for (id, _) in dirty {
            cache.mark_clean(id);
        }
        Ok(())
    }

    /// Swap in the catalog loaded at open.
    pub(crate) fn replace_catalog(&self, catalog: Catalog) {
        *write_lock(&self.catalog) = catalog;
    }

    /// Drop every cached page, writing back any that are still dirty.
    pub(crate) fn evict_all(&self) -> Result<()> {
        let dirty = lock(&self.cache).drain();
        if dirty.is_empty() {
            return Ok(());
        }
        let mut pager = lock(&self.pager);
        for (id, page) in dirty {
            let bytes = page.encode(id)?;
            pager.write_page(id, &bytes)?;
        }
        pager.sync()
    }

    /// A snapshot of the committed database header.
    pub(crate) fn committed_header(&self) -> Result<DbHeader> {
        match &*self.committed_page(0)? {
            Page::Zero(zero) => Ok(zero.header.clone()),
            _ => Err(Error::corrupt("page 0 is not the header page")),
        }
    }
}

/// One open transaction. Obtained from [`Transaction::begin`]; finished by
/// [`Transaction::commit`] or dropped to roll back.
pub struct Transaction {
    id: TxnId,
    db: Arc<DbShared>,
    cancel: CancelToken,
    /// Page versions observed by this transaction.
    read_set: HashMap<PageId, u32>,
    /// Working images, installed into the committed cache on commit.
    write_set: HashMap<PageId, Arc<Page>>,
    /// Committed bytes of every page in `write_set`, for the journal.
    /// Pages allocated past the committed end of file have no pre-image;
    /// journal recovery removes them by truncating to the original size.
    pre_images: HashMap<PageId, Vec<u8>>,
    /// Catalog effects to publish on commit, in statement order.
    ddl_ops: Vec<DdlOp>,
    /// Transaction-local view of created/dropped/altered tables.
    overlay: HashMap<String, Option<Arc<TableSchema>>>,
}

impl Transaction {
    pub fn begin(db: Arc<DbShared>, cancel: CancelToken) -> Self {
        let id = db.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction {
            id,
            db,
            cancel,
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            pre_images: HashMap::new(),
            ddl_ops: Vec::new(),
            overlay: HashMap::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// True when nothing would be published by a commit.
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.ddl_ops.is_empty()
    }

    // ------------------------------------------------------------------
    // Schema resolution
    // ------------------------------------------------------------------

    /// Resolve a table, seeing this transaction's own uncommitted DDL.
    pub fn resolve_table(&self, name: &str) -> Result<Arc<TableSchema>> {
        if let Some(entry) = self.overlay.get(name) {
            return entry.clone().ok_or_else(|| Error::NotFound {
                what: "table",
                name: name.to_string(),
            });
        }
        read_lock(&self.db.catalog)
            .get(name)
            .ok_or_else(|| Error::NotFound {
                what: "table",
                name: name.to_string(),
            })
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.resolve_table(name).is_ok()
    }

    /// Find the table owning index `name`, overlay included.
    pub fn table_of_index(&self, name: &str) -> Option<Arc<TableSchema>> {
        for entry in self.overlay.values().flatten() {
            if entry.index_named(name).is_some() {
                return Some(entry.clone());
            }
        }
        let catalog = read_lock(&self.db.catalog);
        catalog
            .table_of_index(name)
            .filter(|t| !self.overlay.contains_key(&t.name))
    }

    /// Record a DDL effect: it becomes visible to this transaction at
    /// once and to everyone else when the commit publishes it.
    pub fn record_ddl(&mut self, op: DdlOp) -> Result<()> {
        match &op {
            DdlOp::CreateTable(table) => {
                self.overlay
                    .insert(table.name.clone(), Some(table.clone()));
            }
            DdlOp::DropTable(name) => {
                self.overlay.insert(name.clone(), None);
            }
            DdlOp::CreateIndex { table, index } => {
                let current = self.resolve_table(table)?;
                self.overlay.insert(
                    table.clone(),
                    Some(Arc::new(current.with_index(index.clone()))),
                );
            }
            DdlOp::DropIndex { table, index } => {
                let current = self.resolve_table(table)?;
                self.overlay.insert(
                    table.clone(),
                    Some(Arc::new(current.without_index(index))),
                );
            }
        }
        self.ddl_ops.push(op);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Header access
    // ------------------------------------------------------------------

    /// The database header as this transaction sees it.
    pub fn header(&mut self) -> Result<DbHeader> {
        match &*self.page(0)? {
            Page::Zero(zero) => Ok(zero.header.clone()),
            _ => Err(Error::corrupt("page 0 is not the header page")),
        }
    }

    fn update_header(&mut self, f: impl FnOnce(&mut DbHeader)) -> Result<()> {
        match self.page_mut(0)? {
            Page::Zero(zero) => {
                f(&mut zero.header);
                Ok(())
            }
            _ => Err(Error::corrupt("page 0 is not the header page")),
        }
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commit: validate, journal, flush, publish. Consumes the
    /// transaction either way; on error nothing has been published.
    pub fn commit(mut self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let db = self.db.clone();
        let _commit_guard = lock(&db.commit_lock);

        // OCC validation: every page read must still be at the version we
        // saw. Report the first mismatch in ascending page order.
        let mut reads: Vec<(PageId, u32)> =
            self.read_set.iter().map(|(id, v)| (*id, *v)).collect();
        reads.sort_unstable_by_key(|(id, _)| *id);
        for (id, seen) in reads {
            let current = db.committed_page(id)?.version();
            if current != seen {
                debug!(
                    "txn {} conflict on page {}: read v{}, committed v{}",
                    self.id, id, seen, current
                );
                return Err(Error::TxConflict { page: id });
            }
        }

        // Step 1: journal the pre-images so the committed state can be
        // restored if the flush below is interrupted.
        let original_total = db.committed_header()?.total_pages;
        let journaled = db.config.journal && !self.pre_images.is_empty();
        if journaled {
            let mut entries: Vec<(PageId, Vec<u8>)> = self.pre_images.drain().collect();
            entries.sort_unstable_by_key(|(id, _)| *id);
            journal::write(&db.path, original_total, &entries)?;
        }

        // Steps 2-3: install the working set as dirty committed pages and
        // flush them.
        let mut ids: Vec<PageId> = self.write_set.keys().copied().collect();
        ids.sort_unstable();
        let mut spilled = Vec::new();
        {
            let mut cache = lock(&db.cache);
            for id in ids {
                if let Some(page) = self.write_set.remove(&id) {
                    if let Some(eviction) = cache.put(id, page, true) {
                        spilled.push(eviction);
                    }
                }
            }
        }
        if !spilled.is_empty() {
            let mut pager = lock(&db.pager);
            for (id, page) in spilled {
                let bytes = page.encode(id)?;
                pager.write_page(id, &bytes)?;
            }
        }
        db.flush_dirty()?;

        // Step 4: the commit is durable, drop the journal.
        if journaled {
            journal::release(&db.path)?;
        }

        // Publish DDL effects now that the pages carrying them are
        // committed.
        if !self.ddl_ops.is_empty() {
            let mut catalog = write_lock(&db.catalog);
            for op in &self.ddl_ops {
                catalog.apply(op);
            }
        }
        debug!("txn {} committed", self.id);
        Ok(())
    }

    /// Discard the transaction. Working images were never visible outside
    /// it, so there is nothing to undo on disk.
    pub fn rollback(self) {
        debug!("txn {} rolled back", self.id);
    }
}

impl PageStore for Transaction {
    fn page(&mut self, id: PageId) -> Result<Arc<Page>> {
        if let Some(page) = self.write_set.get(&id) {
            return Ok(page.clone());
        }
        let page = self.db.committed_page(id)?;
        self.read_set.entry(id).or_insert_with(|| page.version());
        Ok(page)
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut Page> {
        if !self.write_set.contains_key(&id) {
            let committed = self.db.committed_page(id)?;
            self.read_set
                .entry(id)
                .or_insert_with(|| committed.version());
            self.pre_images.insert(id, committed.encode(id)?);
            let mut working = (*committed).clone();
            working.bump_version();
            self.write_set.insert(id, Arc::new(working));
        }
        let arc = self
            .write_set
            .get_mut(&id)
            .ok_or_else(|| Error::corrupt("working page vanished"))?;
        Ok(Arc::make_mut(arc))
    }

    fn alloc_page(&mut self, page: Page) -> Result<PageId> {
        let header = self.header()?;
        if header.first_free_page != 0 {
            // Reuse the head of the free list.
            let id = header.first_free_page;
            let next = match &*self.page(id)? {
                Page::Free(free) => free.next,
                _ => return Err(Error::corrupt("free-list head is not a free page")),
            };
            self.update_header(|h| {
                h.first_free_page = next;
                h.free_page_count = h.free_page_count.saturating_sub(1);
            })?;
            let working = self.page_mut(id)?;
            let version = working.version();
            *working = page;
            working.set_version(version);
            Ok(id)
        } else {
            // Grow the file by one page.
            let id = header.total_pages;
            self.update_header(|h| h.total_pages += 1)?;
            self.write_set.insert(id, Arc::new(page));
            Ok(id)
        }
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        let old_head = self.header()?.first_free_page;
        {
            let working = self.page_mut(id)?;
            let version = working.version();
            *working = Page::Free(FreePage {
                next: old_head,
                version,
            });
        }
        self.update_header(|h| {
            h.first_free_page = id;
            h.free_page_count += 1;
        })
    }

    fn cancel(&self) -> &CancelToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bootstrap_zero_page;
    use crate::storage::journal::journal_path;
    use crate::storage::page::{LeafNode, Node};
    use tempfile::TempDir;

    fn open_shared(dir: &TempDir) -> Arc<DbShared> {
        let path = dir.path().join("t.db");
        let mut pager = Pager::open(&path).unwrap();
        if pager.file_pages().unwrap() == 0 {
            let bytes = bootstrap_zero_page(true, 100).unwrap();
            pager.write_page(0, &bytes).unwrap();
            pager.sync().unwrap();
        }
        Arc::new(DbShared::new(
            path,
            Config::default(),
            pager,
            Catalog::default(),
        ))
    }

    fn begin(db: &Arc<DbShared>) -> Transaction {
        Transaction::begin(db.clone(), CancelToken::new())
    }

    fn new_leaf() -> Page {
        Page::Node(Node::Leaf(LeafNode::new_root()))
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut tx = begin(&db);
        let before = tx.header().unwrap().total_pages;
        tx.alloc_page(new_leaf()).unwrap();
        assert_eq!(tx.header().unwrap().total_pages, before + 1);
        tx.rollback();

        let mut tx = begin(&db);
        assert_eq!(tx.header().unwrap().total_pages, before);
    }

    #[test]
    fn test_commit_persists_and_releases_journal() {
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut tx = begin(&db);
        let id = tx.alloc_page(new_leaf()).unwrap();
        tx.commit().unwrap();
        assert!(!journal_path(&db.path).exists());

        // A fresh shared state over the same file sees the page.
        let db2 = open_shared(&dir);
        let mut tx = begin(&db2);
        assert_eq!(tx.header().unwrap().total_pages, 2);
        assert!(tx.page(id).unwrap().node().is_ok());
    }

    #[test]
    fn test_occ_conflict_on_shared_page() {
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut tx1 = begin(&db);
        let mut tx2 = begin(&db);
        tx1.update_header(|h| h.cache_pages_hint = 1).unwrap();
        tx2.update_header(|h| h.cache_pages_hint = 2).unwrap();

        tx1.commit().unwrap();
        match tx2.commit() {
            Err(Error::TxConflict { page: 0 }) => {}
            other => panic!("expected conflict on page 0, got {:?}", other),
        }
    }

    #[test]
    fn test_read_only_commit_never_conflicts() {
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut reader = begin(&db);
        reader.header().unwrap();

        let mut writer = begin(&db);
        writer.update_header(|h| h.cache_pages_hint = 9).unwrap();
        writer.commit().unwrap();

        reader.commit().unwrap();
    }

    #[test]
    fn test_free_list_lifo_reuse() {
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut tx = begin(&db);
        let a = tx.alloc_page(new_leaf()).unwrap();
        let b = tx.alloc_page(new_leaf()).unwrap();
        tx.free_page(a).unwrap();
        tx.free_page(b).unwrap();
        let header = tx.header().unwrap();
        assert_eq!(header.first_free_page, b);
        assert_eq!(header.free_page_count, 2);

        // LIFO: most recently freed first.
        assert_eq!(tx.alloc_page(new_leaf()).unwrap(), b);
        assert_eq!(tx.alloc_page(new_leaf()).unwrap(), a);
        assert_eq!(tx.header().unwrap().free_page_count, 0);

        // Free list exhausted, the file grows again.
        let c = tx.alloc_page(new_leaf()).unwrap();
        assert_eq!(c, header.total_pages);
    }

    #[test]
    fn test_write_skew_is_detected() {
        // Two transactions that read the same page and write different
        // pages still conflict through their page-0 reads.
        let dir = TempDir::new().unwrap();
        let db = open_shared(&dir);

        let mut tx1 = begin(&db);
        let mut tx2 = begin(&db);
        tx1.alloc_page(new_leaf()).unwrap();
        tx2.alloc_page(new_leaf()).unwrap();

        tx1.commit().unwrap();
        assert!(matches!(tx2.commit(), Err(Error::TxConflict { .. })));
    }
}
