//! Table registry: table id to backing file, schema, and name.
//!
//! The catalog is the buffer pool's map from a [`PageId`]'s table component
//! to the heap file that can fill a cache miss. It is a plain in-memory
//! registry; tables are registered at startup by whatever layer owns the
//! database lifecycle.
//!
//! [`PageId`]: crate::storage::page::PageId

use crate::access::heap::HeapFile;
use crate::access::schema::Schema;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type TableId = u32;

/// Everything the kernel knows about one table.
pub struct TableInfo {
    pub table_id: TableId,
    pub name: String,
    pub schema: Schema,
    pub file: Arc<HeapFile>,
}

/// Both lookup directions, kept consistent under one lock.
#[derive(Default)]
struct Registry {
    by_id: HashMap<TableId, Arc<TableInfo>>,
    by_name: HashMap<String, TableId>,
}

pub struct Catalog {
    registry: RwLock<Registry>,
    next_table_id: AtomicU32,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_table_id: AtomicU32::new(1),
        }
    }

    /// Creates a fresh backing file at `path` and registers it under `name`.
    pub fn register_table(
        &self,
        name: &str,
        schema: Schema,
        path: &Path,
    ) -> StorageResult<TableId> {
        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(HeapFile::create(path, table_id, schema.clone())?);
        self.insert(name, schema, table_id, file)?;
        Ok(table_id)
    }

    /// Registers an existing backing file under `name`.
    pub fn open_table(&self, name: &str, schema: Schema, path: &Path) -> StorageResult<TableId> {
        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(HeapFile::open(path, table_id, schema.clone())?);
        self.insert(name, schema, table_id, file)?;
        Ok(table_id)
    }

    pub fn table(&self, table_id: TableId) -> StorageResult<Arc<TableInfo>> {
        self.registry
            .read()
            .by_id
            .get(&table_id)
            .cloned()
            .ok_or(StorageError::TableNotFound(table_id))
    }

    pub fn table_id(&self, name: &str) -> StorageResult<TableId> {
        self.registry
            .read()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::TableNameNotFound(name.into()))
    }

    /// The heap file backing `table_id`.
    pub fn heap_file(&self, table_id: TableId) -> StorageResult<Arc<HeapFile>> {
        Ok(Arc::clone(&self.table(table_id)?.file))
    }

    pub fn schema(&self, table_id: TableId) -> StorageResult<Schema> {
        Ok(self.table(table_id)?.schema.clone())
    }

    pub fn table_name(&self, table_id: TableId) -> StorageResult<String> {
        Ok(self.table(table_id)?.name.clone())
    }

    fn insert(
        &self,
        name: &str,
        schema: Schema,
        table_id: TableId,
        file: Arc<HeapFile>,
    ) -> StorageResult<()> {
        let mut registry = self.registry.write();
        if registry.by_name.contains_key(name) {
            return Err(StorageError::TableExists(name.into()));
        }
        registry.by_name.insert(name.to_string(), table_id);
        registry.by_id.insert(
            table_id,
            Arc::new(TableInfo {
                table_id,
                name: name.to_string(),
                schema,
                file,
            }),
        );
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
