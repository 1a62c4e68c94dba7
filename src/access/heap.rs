use crate::access::schema::Schema;
use crate::access::scan::TableScan;
use crate::access::tuple::Tuple;
use crate::catalog::TableId;
use crate::concurrency::LockMode;
use crate::error::{StorageError, StorageResult};
use crate::storage::buffer::BufferPool;
use crate::storage::page::{HeapPage, PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// A table's durable storage: an append-only sequence of fixed-size pages
/// in one backing file, page `i` at byte offset `i * 4096`.
///
/// All page access during tuple operations goes through the buffer pool, so
/// that locking and caching apply uniformly; only `read_page`/`write_page`
/// touch the file directly, on behalf of the pool.
pub struct HeapFile {
    table_id: TableId,
    schema: Schema,
    file: Mutex<File>,
}

impl HeapFile {
    /// Creates a new, empty backing file. Truncates an existing one.
    pub fn create(path: &Path, table_id: TableId, schema: Schema) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            table_id,
            schema,
            file: Mutex::new(file),
        })
    }

    /// Opens an existing backing file.
    pub fn open(path: &Path, table_id: TableId, schema: Schema) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            table_id,
            schema,
            file: Mutex::new(file),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of pages in the file.
    pub fn num_pages(&self) -> StorageResult<u32> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok(len.div_ceil(PAGE_SIZE as u64) as u32)
    }

    /// Reads and decodes the page at `pid`'s offset. A read past the end of
    /// the file is [`StorageError::PageNotFound`]; a short read is an I/O
    /// error.
    pub fn read_page(&self, pid: PageId) -> StorageResult<HeapPage> {
        if pid.table != self.table_id {
            return Err(StorageError::PageNotFound(pid));
        }
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if pid.offset() >= len {
            return Err(StorageError::PageNotFound(pid));
        }
        file.seek(SeekFrom::Start(pid.offset()))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf)?;
        drop(file);
        HeapPage::from_bytes(pid, self.schema.clone(), &buf)
    }

    /// Encodes `page` into exactly 4096 bytes and writes it at its offset.
    pub fn write_page(&self, page: &HeapPage) -> StorageResult<()> {
        let pid = page.page_id();
        if pid.table != self.table_id {
            return Err(StorageError::PageNotFound(pid));
        }
        let bytes = page.to_bytes()?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pid.offset()))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Places `tuple` into the first page with a free slot, scanning pages
    /// in order with EXCLUSIVE fetches through the pool; extends the file
    /// with a fresh page when every existing page is full. Returns the
    /// page(s) the insertion touched.
    ///
    /// The linear free-space scan is the deliberate baseline policy,
    /// O(pages) per insert.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        tuple: Tuple,
        pool: &BufferPool,
    ) -> StorageResult<Vec<Arc<RwLock<HeapPage>>>> {
        if tuple.schema() != &self.schema {
            return Err(StorageError::SchemaMismatch(format!(
                "tuple schema {} does not match table schema {}",
                tuple.schema(),
                self.schema
            )));
        }
        if !tuple.is_complete() {
            return Err(StorageError::SchemaMismatch(
                "cannot insert a tuple with unset fields".into(),
            ));
        }

        let num_pages = self.num_pages()?;
        for page_no in 0..num_pages {
            let pid = PageId::new(self.table_id, page_no);
            let page = pool.fetch(tid, pid, LockMode::Exclusive)?;
            let mut guard = page.write();
            if guard.free_slots() > 0 {
                guard.insert_tuple(tuple.clone())?;
                drop(guard);
                return Ok(vec![page]);
            }
            // Full page: the lock stays held (two-phase locking), move on.
        }

        // Every page is full: extend the store with an empty page.
        let pid = self.append_empty_page()?;
        debug!("table {} extended with page {}", self.table_id, pid);
        let page = pool.fetch(tid, pid, LockMode::Exclusive)?;
        page.write().insert_tuple(tuple)?;
        Ok(vec![page])
    }

    /// Clears the slot named by the tuple's record id. Fails when the
    /// record id is missing or belongs to another table.
    pub fn delete_tuple(
        &self,
        tid: TransactionId,
        tuple: &Tuple,
        pool: &BufferPool,
    ) -> StorageResult<Arc<RwLock<HeapPage>>> {
        let rid = tuple.record_id().ok_or(StorageError::TupleNotPersisted)?;
        if rid.page_id.table != self.table_id {
            return Err(StorageError::TupleNotFound {
                page_id: rid.page_id,
                slot: rid.slot,
            });
        }
        let page = pool.fetch(tid, rid.page_id, LockMode::Exclusive)?;
        page.write().delete_tuple(rid)?;
        Ok(page)
    }

    /// A lazy, restartable scan over the whole table: pages in order,
    /// fetched SHARED, occupied slots in slot order.
    pub fn scan<'a>(self: &Arc<Self>, tid: TransactionId, pool: &'a BufferPool) -> TableScan<'a> {
        TableScan::new(pool, Arc::clone(self), tid)
    }

    /// Writes an all-zero page at the end of the file and returns its id.
    fn append_empty_page(&self) -> StorageResult<PageId> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_no = len.div_ceil(PAGE_SIZE as u64) as u32;
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        file.sync_all()?;
        Ok(PageId::new(self.table_id, page_no))
    }
}
