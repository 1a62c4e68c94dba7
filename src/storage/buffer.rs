pub mod lru;
pub mod replacer;

use crate::access::tuple::Tuple;
use crate::catalog::{Catalog, TableId};
use crate::concurrency::{LockManager, LockMode};
use crate::error::{StorageError, StorageResult};
use crate::storage::page::{HeapPage, PageId};
use crate::transaction::TransactionId;
use log::debug;
use lru::LruReplacer;
use parking_lot::{Mutex, RwLock};
use replacer::Replacer;
use std::collections::HashMap;
use std::sync::Arc;

/// Default pool capacity, in pages.
pub const DEFAULT_CAPACITY: usize = 50;

/// Cache map and recency structure. The two must agree on which pages are
/// resident, so they live behind one mutex and mutate only together.
struct CacheInner {
    pages: HashMap<PageId, Arc<RwLock<HeapPage>>>,
    replacer: Box<dyn Replacer>,
}

/// Bounded cache of pages and the only mediation point between
/// transactions and on-disk storage.
///
/// Every fetch first acquires the page lock from the owned [`LockManager`]
/// (which may block), then consults the cache. All fetchers of a resident
/// page share one `Arc<RwLock<HeapPage>>`, so in-place writes are visible
/// to every later fetch without re-reading disk.
///
/// Eviction is no-steal: a dirty page is never written back (or dropped)
/// before its transaction commits, so only clean pages are eviction
/// victims. When every resident page is dirty the pool is exhausted and
/// the fetch fails rather than forcing a premature flush.
pub struct BufferPool {
    capacity: usize,
    cache: Mutex<CacheInner>,
    lock_manager: LockManager,
    catalog: Arc<Catalog>,
}

impl BufferPool {
    pub fn new(capacity: usize, catalog: Arc<Catalog>) -> Self {
        Self::with_replacer(capacity, catalog, Box::new(LruReplacer::new()))
    }

    pub fn with_replacer(
        capacity: usize,
        catalog: Arc<Catalog>,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        Self {
            capacity,
            cache: Mutex::new(CacheInner {
                pages: HashMap::with_capacity(capacity),
                replacer,
            }),
            lock_manager: LockManager::new(),
            catalog,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Fetches a page on behalf of `tid`, blocking until the requested lock
    /// mode is granted.
    ///
    /// On a hit the resident page is returned as-is; on a miss the page is
    /// read from its table's backing file, evicting a clean victim first if
    /// the pool is at capacity.
    pub fn fetch(
        &self,
        tid: TransactionId,
        pid: PageId,
        mode: LockMode,
    ) -> StorageResult<Arc<RwLock<HeapPage>>> {
        self.lock_manager.acquire(tid, pid, mode);

        let mut cache = self.cache.lock();
        if let Some(page) = cache.pages.get(&pid).cloned() {
            cache.replacer.touch(pid);
            return Ok(page);
        }

        if cache.pages.len() >= self.capacity {
            Self::evict_locked(&mut cache)?;
        }

        // Miss-fill happens inside the critical section, so two callers
        // missing on the same pid cannot both read and insert it.
        let file = self.catalog.heap_file(pid.table)?;
        let page = Arc::new(RwLock::new(file.read_page(pid)?));
        cache.pages.insert(pid, Arc::clone(&page));
        cache.replacer.touch(pid);
        Ok(page)
    }

    /// Adds a tuple to `table` on behalf of `tid`.
    ///
    /// The table's heap file fetches candidate pages EXCLUSIVE and writes
    /// into the first free slot, allocating a new page if none has room.
    /// Every touched page is marked dirty-owned-by-`tid` and (re)inserted
    /// into the cache, which covers newly allocated pages.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table: TableId,
        tuple: Tuple,
    ) -> StorageResult<()> {
        let file = self.catalog.heap_file(table)?;
        let touched = file.insert_tuple(tid, tuple, self)?;
        for page in touched {
            let pid = {
                let mut guard = page.write();
                guard.mark_dirty(tid);
                guard.page_id()
            };
            self.cache_insert(pid, page)?;
        }
        Ok(())
    }

    /// Removes the tuple named by its record id, marking the touched page
    /// dirty-owned-by-`tid`.
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> StorageResult<()> {
        let rid = tuple.record_id().ok_or(StorageError::TupleNotPersisted)?;
        let file = self.catalog.heap_file(rid.page_id.table)?;
        let page = file.delete_tuple(tid, tuple, self)?;
        let pid = {
            let mut guard = page.write();
            guard.mark_dirty(tid);
            guard.page_id()
        };
        self.cache_insert(pid, page)
    }

    /// Commits `tid`: every page it dirtied is written to its backing file
    /// and becomes the new rollback point, then all of `tid`'s locks are
    /// released.
    ///
    /// If a flush fails the transaction aborts instead: the remaining
    /// in-memory state is rolled back, locks are released, and the I/O
    /// error propagates.
    pub fn commit(&self, tid: TransactionId) -> StorageResult<()> {
        let resident = self.resident();
        for page in &resident {
            if page.read().dirty_owner() != Some(tid) {
                continue;
            }
            if let Err(e) = self.flush_page(page) {
                // The abort path still runs: restore in-memory state and
                // release the locks before the failure propagates.
                let result = self.rollback(tid, &resident).and(Err(e));
                self.lock_manager.release_all(tid);
                return result;
            }
        }
        self.lock_manager.release_all(tid);
        debug!("{} committed", tid);
        Ok(())
    }

    /// Aborts `tid`: every page it dirtied is restored from its
    /// before-image (no disk write), then all of `tid`'s locks are
    /// released. On-disk state is untouched.
    pub fn abort(&self, tid: TransactionId) -> StorageResult<()> {
        let resident = self.resident();
        let result = self.rollback(tid, &resident);
        self.lock_manager.release_all(tid);
        debug!("{} aborted", tid);
        result
    }

    /// True if `tid` holds a lock of any mode on `pid`.
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_manager.holds(tid, pid)
    }

    /// Releases `tid`'s lock on one page without ending the transaction.
    ///
    /// Breaking two-phase locking this way forfeits serializability for
    /// `tid`; the legitimate caller is one that never read the page's
    /// contents, such as a free-space probe that found the page full.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        self.lock_manager.release(tid, pid);
    }

    /// Drops `pid` from the cache unconditionally, without writing it back.
    ///
    /// Maintenance hook for recovery-style callers that must not let a
    /// stale copy survive in the cache. Discarding a page the pool does not
    /// track is an invariant violation.
    pub fn discard(&self, pid: PageId) -> StorageResult<()> {
        let mut cache = self.cache.lock();
        let in_map = cache.pages.remove(&pid).is_some();
        let in_recency = cache.replacer.remove(pid);
        if !in_map || !in_recency {
            debug_assert!(false, "discard of untracked page {}", pid);
            return Err(StorageError::InvariantViolation(format!(
                "discard of untracked page {} (cached: {}, tracked for eviction: {})",
                pid, in_map, in_recency
            )));
        }
        Ok(())
    }

    /// Writes every dirty resident page to disk, regardless of owner.
    ///
    /// This breaks the no-steal policy by persisting uncommitted data; it
    /// exists for shutdown and recovery tooling, not for the transaction
    /// path.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        for page in self.resident() {
            if page.read().is_dirty() {
                self.flush_page(&page)?;
            }
        }
        Ok(())
    }

    /// Number of pages currently resident.
    pub fn resident_pages(&self) -> usize {
        self.cache.lock().pages.len()
    }

    /// (Re)inserts a page touched by a mutation, evicting if needed.
    fn cache_insert(&self, pid: PageId, page: Arc<RwLock<HeapPage>>) -> StorageResult<()> {
        let mut cache = self.cache.lock();
        if !cache.pages.contains_key(&pid) {
            if cache.pages.len() >= self.capacity {
                Self::evict_locked(&mut cache)?;
            }
            cache.pages.insert(pid, page);
        }
        cache.replacer.touch(pid);
        Ok(())
    }

    /// Evicts the least-recently-used clean page. Caller holds the cache
    /// mutex.
    fn evict_locked(cache: &mut CacheInner) -> StorageResult<()> {
        let CacheInner { pages, replacer } = cache;
        let victim = replacer.victim(&|pid| {
            pages
                .get(&pid)
                .is_some_and(|page| page.try_read().map(|guard| !guard.is_dirty()).unwrap_or(false))
        });
        match victim {
            Some(pid) => {
                debug!("evicting page {}", pid);
                if pages.remove(&pid).is_none() {
                    debug_assert!(false, "evicted page {} missing from cache map", pid);
                    return Err(StorageError::InvariantViolation(format!(
                        "evicted page {} was tracked for eviction but not cached",
                        pid
                    )));
                }
                Ok(())
            }
            None => Err(StorageError::ResourceExhausted),
        }
    }

    fn resident(&self) -> Vec<Arc<RwLock<HeapPage>>> {
        self.cache.lock().pages.values().cloned().collect()
    }

    fn flush_page(&self, page: &Arc<RwLock<HeapPage>>) -> StorageResult<()> {
        let mut guard = page.write();
        let file = self.catalog.heap_file(guard.page_id().table)?;
        file.write_page(&guard)?;
        guard.set_before_image()?;
        guard.clear_dirty();
        Ok(())
    }

    fn rollback(&self, tid: TransactionId, pages: &[Arc<RwLock<HeapPage>>]) -> StorageResult<()> {
        for page in pages {
            let mut guard = page.write();
            if guard.dirty_owner() == Some(tid) {
                guard.restore_before_image()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::schema::{Column, Schema};
    use crate::access::value::{DataType, Field};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Int),
            Column::new("name", DataType::Varchar(12)),
        ])
    }

    fn tuple(id: i32, name: &str) -> Tuple {
        Tuple::from_fields(schema(), vec![Field::Int(id), Field::Varchar(name.into())]).unwrap()
    }

    fn setup(capacity: usize) -> (TempDir, Arc<Catalog>, TableId, BufferPool) {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::new());
        let table = catalog
            .register_table("t", schema(), &dir.path().join("t.tbl"))
            .unwrap();
        let pool = BufferPool::new(capacity, Arc::clone(&catalog));
        (dir, catalog, table, pool)
    }

    fn tid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    /// Fills page 0..n-1 of the table with enough tuples to occupy whole
    /// pages. Commits at each page boundary so at most one page is dirty at
    /// a time, which keeps small pools evictable while filling.
    fn fill_pages(pool: &BufferPool, table: TableId, pages: usize) {
        let slots = crate::storage::page::heap_page::slot_count(&schema());
        let t = tid(1000);
        for i in 0..pages * slots {
            pool.insert_tuple(t, table, tuple(i as i32, "fill")).unwrap();
            if (i + 1) % slots == 0 {
                pool.commit(t).unwrap();
            }
        }
        pool.commit(t).unwrap();
    }

    #[test]
    fn test_fetch_caches_one_copy() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(4);
        fill_pages(&pool, table, 1);

        let pid = PageId::new(table, 0);
        let a = pool.fetch(tid(1), pid, LockMode::Shared)?;
        let b = pool.fetch(tid(2), pid, LockMode::Shared)?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.resident_pages(), 1);
        Ok(())
    }

    #[test]
    fn test_fetch_unknown_table() {
        let (_dir, _catalog, _table, pool) = setup(4);
        let err = pool.fetch(tid(1), PageId::new(99, 0), LockMode::Shared);
        assert!(matches!(err, Err(StorageError::TableNotFound(99))));
    }

    #[test]
    fn test_fetch_unknown_page() {
        let (_dir, _catalog, table, pool) = setup(4);
        let err = pool.fetch(tid(1), PageId::new(table, 7), LockMode::Shared);
        assert!(matches!(err, Err(StorageError::PageNotFound(_))));
    }

    #[test]
    fn test_capacity_is_never_exceeded() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(2);
        fill_pages(&pool, table, 4);

        for page_no in 0..4 {
            pool.fetch(tid(1), PageId::new(table, page_no), LockMode::Shared)?;
            assert!(pool.resident_pages() <= 2);
        }
        Ok(())
    }

    #[test]
    fn test_lru_eviction_order() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(2);
        fill_pages(&pool, table, 3);

        let a = PageId::new(table, 0);
        let b = PageId::new(table, 1);
        let c = PageId::new(table, 2);

        // Fetch A then B: pool full, both clean. Fetching C evicts A, the
        // least recently used clean page.
        let page_a = pool.fetch(tid(1), a, LockMode::Shared)?;
        pool.fetch(tid(1), b, LockMode::Shared)?;
        pool.fetch(tid(1), c, LockMode::Shared)?;

        assert_eq!(pool.resident_pages(), 2);
        // A refetch of B or C returns the same resident object; A was
        // dropped and comes back as a fresh read.
        let page_b2 = pool.fetch(tid(1), b, LockMode::Shared)?;
        let page_a2 = pool.fetch(tid(1), a, LockMode::Shared)?;
        assert!(!Arc::ptr_eq(&page_a, &page_a2));
        let _ = page_b2;
        Ok(())
    }

    #[test]
    fn test_dirty_pages_are_not_evicted() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(2);
        fill_pages(&pool, table, 3);

        let t = tid(1);
        // Dirty page 0 by deleting a tuple from it.
        let page = pool.fetch(t, PageId::new(table, 0), LockMode::Exclusive)?;
        let victim = page.read().tuple(0).cloned().unwrap();
        drop(page);
        pool.delete_tuple(t, &victim)?;

        // Fill the second slot with page 1, then fetch page 2: the only
        // eviction candidate is page 1, since page 0 is dirty.
        pool.fetch(t, PageId::new(table, 1), LockMode::Shared)?;
        pool.fetch(t, PageId::new(table, 2), LockMode::Shared)?;

        let page0 = pool.fetch(t, PageId::new(table, 0), LockMode::Shared)?;
        assert_eq!(page0.read().dirty_owner(), Some(t));
        Ok(())
    }

    #[test]
    fn test_all_dirty_pool_is_exhausted() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(2);
        fill_pages(&pool, table, 3);

        let t = tid(1);
        for page_no in 0..2 {
            let page = pool.fetch(t, PageId::new(table, page_no), LockMode::Exclusive)?;
            let victim = page.read().tuple(0).cloned().unwrap();
            drop(page);
            pool.delete_tuple(t, &victim)?;
        }

        let err = pool.fetch(t, PageId::new(table, 2), LockMode::Shared);
        assert!(matches!(err, Err(StorageError::ResourceExhausted)));
        Ok(())
    }

    #[test]
    fn test_insert_allocates_pages_as_needed() -> StorageResult<()> {
        let (_dir, catalog, table, pool) = setup(4);
        let slots = crate::storage::page::heap_page::slot_count(&schema());
        let file = catalog.heap_file(table)?;
        let t = tid(1);

        pool.insert_tuple(t, table, tuple(0, "first"))?;
        assert_eq!(file.num_pages()?, 1);

        for i in 1..=slots as i32 {
            pool.insert_tuple(t, table, tuple(i, "more"))?;
        }
        // slots + 1 tuples: page 0 full, one spilled onto page 1.
        assert_eq!(file.num_pages()?, 2);

        let page0 = pool.fetch(t, PageId::new(table, 0), LockMode::Shared)?;
        let page1 = pool.fetch(t, PageId::new(table, 1), LockMode::Shared)?;
        assert_eq!(page0.read().free_slots(), 0);
        assert_eq!(page1.read().free_slots(), slots - 1);
        Ok(())
    }

    #[test]
    fn test_insert_marks_dirty_and_caches() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(4);
        let t = tid(1);

        pool.insert_tuple(t, table, tuple(1, "x"))?;
        assert_eq!(pool.resident_pages(), 1);

        let page = pool.fetch(t, PageId::new(table, 0), LockMode::Shared)?;
        assert_eq!(page.read().dirty_owner(), Some(t));
        Ok(())
    }

    #[test]
    fn test_insert_schema_mismatch_is_synchronous() {
        let (_dir, _catalog, table, pool) = setup(4);
        let other = Schema::new(vec![Column::new("only", DataType::Int)]);
        let bad = Tuple::from_fields(other, vec![Field::Int(1)]).unwrap();

        let err = pool.insert_tuple(tid(1), table, bad);
        assert!(matches!(err, Err(StorageError::SchemaMismatch(_))));
        assert_eq!(pool.resident_pages(), 0);
    }

    #[test]
    fn test_delete_requires_record_id() {
        let (_dir, _catalog, _table, pool) = setup(4);
        let err = pool.delete_tuple(tid(1), &tuple(1, "x"));
        assert!(matches!(err, Err(StorageError::TupleNotPersisted)));
    }

    #[test]
    fn test_insert_then_delete_restores_bitmap() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(4);
        fill_pages(&pool, table, 1);

        let t = tid(1);
        let pid = PageId::new(table, 0);
        let page = pool.fetch(t, pid, LockMode::Exclusive)?;
        let free_before = page.read().free_slots();
        drop(page);

        // A full page forces this insert onto a new page; delete an
        // existing tuple first so page 0 takes it.
        let page = pool.fetch(t, pid, LockMode::Exclusive)?;
        let existing = page.read().tuple(3).cloned().unwrap();
        drop(page);
        pool.delete_tuple(t, &existing)?;
        pool.insert_tuple(t, table, tuple(777, "back"))?;

        let page = pool.fetch(t, pid, LockMode::Shared)?;
        assert_eq!(page.read().free_slots(), free_before);
        assert!(page.read().is_occupied(3));
        Ok(())
    }

    #[test]
    fn test_discard_untracked_is_invariant_violation() {
        let (_dir, _catalog, table, pool) = setup(4);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.discard(PageId::new(table, 0))
        }));
        // Debug builds assert; release builds report the violation.
        match result {
            Ok(r) => assert!(matches!(r, Err(StorageError::InvariantViolation(_)))),
            Err(_) => {}
        }
    }

    #[test]
    fn test_discard_tracked_page() -> StorageResult<()> {
        let (_dir, _catalog, table, pool) = setup(4);
        fill_pages(&pool, table, 1);

        let pid = PageId::new(table, 0);
        pool.fetch(tid(1), pid, LockMode::Shared)?;
        assert_eq!(pool.resident_pages(), 1);

        pool.discard(pid)?;
        assert_eq!(pool.resident_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_commit_persists_and_clears_dirty() -> StorageResult<()> {
        let (_dir, catalog, table, pool) = setup(4);
        let t = tid(1);
        pool.insert_tuple(t, table, tuple(5, "five"))?;
        pool.commit(t)?;

        // The page on disk now carries the tuple.
        let file = catalog.heap_file(table)?;
        let on_disk = file.read_page(PageId::new(table, 0))?;
        assert_eq!(on_disk.tuple(0).unwrap(), &tuple(5, "five"));

        // Resident copy is clean and its locks are gone.
        let pid = PageId::new(table, 0);
        assert!(!pool.holds(t, pid));
        let page = pool.fetch(tid(2), pid, LockMode::Shared)?;
        assert!(!page.read().is_dirty());
        Ok(())
    }

    #[test]
    fn test_abort_restores_before_image() -> StorageResult<()> {
        let (_dir, catalog, table, pool) = setup(4);
        fill_pages(&pool, table, 1);
        let file = catalog.heap_file(table)?;
        let before = file.read_page(PageId::new(table, 0))?.to_bytes()?;

        let t = tid(1);
        let page = pool.fetch(t, PageId::new(table, 0), LockMode::Exclusive)?;
        let victim = page.read().tuple(0).cloned().unwrap();
        drop(page);
        pool.delete_tuple(t, &victim)?;
        pool.abort(t)?;

        // In-memory and on-disk copies both match the pre-transaction bytes.
        let page = pool.fetch(tid(2), PageId::new(table, 0), LockMode::Shared)?;
        assert_eq!(page.read().to_bytes()?, before);
        assert_eq!(file.read_page(PageId::new(table, 0))?.to_bytes()?, before);
        assert!(!pool.holds(t, PageId::new(table, 0)));
        Ok(())
    }
}
