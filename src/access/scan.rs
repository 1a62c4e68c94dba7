use crate::access::heap::HeapFile;
use crate::access::tuple::Tuple;
use crate::concurrency::LockMode;
use crate::error::StorageResult;
use crate::storage::buffer::BufferPool;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use std::collections::VecDeque;
use std::sync::Arc;

/// Cursor position of a [`TableScan`].
#[derive(Debug)]
enum ScanState {
    NotStarted,
    Scanning {
        /// Next page to fetch.
        next_page: u32,
        /// Page count captured when the scan (re)started.
        page_count: u32,
        /// Tuples of the current page not yet yielded.
        buffered: VecDeque<Tuple>,
    },
    Done,
}

/// A lazy, restartable scan over one table.
///
/// Pages are fetched SHARED through the buffer pool in page order, and
/// occupied slots are yielded in slot-index order. [`TableScan::rewind`]
/// restarts at page 0; the locks the transaction already holds are simply
/// re-granted, so rewinding never blocks on pages seen before.
pub struct TableScan<'a> {
    pool: &'a BufferPool,
    file: Arc<HeapFile>,
    tid: TransactionId,
    state: ScanState,
}

impl<'a> TableScan<'a> {
    pub fn new(pool: &'a BufferPool, file: Arc<HeapFile>, tid: TransactionId) -> Self {
        Self {
            pool,
            file,
            tid,
            state: ScanState::NotStarted,
        }
    }

    /// Restarts the scan from the first page.
    pub fn rewind(&mut self) {
        self.state = ScanState::NotStarted;
    }
}

impl Iterator for TableScan<'_> {
    type Item = StorageResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                ScanState::NotStarted => match self.file.num_pages() {
                    Ok(page_count) => {
                        self.state = ScanState::Scanning {
                            next_page: 0,
                            page_count,
                            buffered: VecDeque::new(),
                        };
                    }
                    Err(e) => {
                        self.state = ScanState::Done;
                        return Some(Err(e));
                    }
                },
                ScanState::Scanning { .. } => {
                    if let ScanState::Scanning {
                        ref mut buffered, ..
                    } = self.state
                    {
                        if let Some(tuple) = buffered.pop_front() {
                            return Some(Ok(tuple));
                        }
                    }

                    let (next_page, page_count) = match self.state {
                        ScanState::Scanning {
                            next_page,
                            page_count,
                            ..
                        } => (next_page, page_count),
                        _ => unreachable!(),
                    };
                    if next_page >= page_count {
                        self.state = ScanState::Done;
                        return None;
                    }

                    let pid = PageId::new(self.file.table_id(), next_page);
                    match self.pool.fetch(self.tid, pid, LockMode::Shared) {
                        Ok(page) => {
                            let tuples: Vec<Tuple> = page.read().iter().cloned().collect();
                            if let ScanState::Scanning {
                                ref mut next_page,
                                ref mut buffered,
                                ..
                            } = self.state
                            {
                                *next_page += 1;
                                buffered.extend(tuples);
                            }
                        }
                        Err(e) => {
                            self.state = ScanState::Done;
                            return Some(Err(e));
                        }
                    }
                }
                ScanState::Done => return None,
            }
        }
    }
}
