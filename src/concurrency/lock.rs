//! Page-granularity two-phase locking.
//!
//! The lock manager is the sole arbiter of concurrent page access: every
//! page fetch acquires a shared or exclusive lock here first, and locks are
//! held until the owning transaction commits or aborts.
//!
//! There is no deadlock detection and no fairness among waiters. A cycle of
//! transactions waiting on each other hangs forever; in particular, two
//! transactions both holding SHARED on a page and both requesting the
//! upgrade to EXCLUSIVE deadlock each other, since neither is ever the sole
//! holder. This is an accepted property of the design, not a defect to work
//! around here.

use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use dashmap::DashMap;
use log::trace;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for read operations.
    Shared,
    /// Exclusive lock for write operations.
    Exclusive,
}

/// Per-page lock state: the holder set, guarded by a mutex paired with the
/// page's wait condition.
#[derive(Debug, Default)]
struct PageLock {
    holders: Mutex<HashMap<TransactionId, LockMode>>,
    cond: Condvar,
}

/// Lock manager enforcing two-phase locking at page granularity.
#[derive(Debug, Default)]
pub struct LockManager {
    /// Per-page lock state. Entries persist once created; the holder map
    /// inside empties on release.
    pages: DashMap<PageId, Arc<PageLock>>,
    /// Pages each transaction currently holds locks on.
    held: DashMap<TransactionId, HashSet<PageId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            held: DashMap::new(),
        }
    }

    /// Blocks the calling thread until `tid` holds a `mode` lock on `pid`.
    ///
    /// The grant rule is re-evaluated every time the caller is woken:
    /// - `tid` already holds EXCLUSIVE: granted, whatever `mode` is;
    /// - `tid` holds SHARED and requests SHARED: granted;
    /// - `tid` holds SHARED and requests EXCLUSIVE: granted only while it
    ///   is the sole holder, as an atomic in-place upgrade;
    /// - otherwise SHARED is granted when no holder is EXCLUSIVE, and
    ///   EXCLUSIVE when there are no holders at all.
    ///
    /// Waiters suspend on the page's condition variable and are woken by
    /// any release on the page; spurious wakeups just re-check the rule.
    pub fn acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) {
        let lock = self
            .pages
            .entry(pid)
            .or_insert_with(|| Arc::new(PageLock::default()))
            .clone();

        let mut holders = lock.holders.lock().unwrap();
        while !try_grant(&mut holders, tid, mode) {
            trace!("{} blocked on page {} ({:?})", tid, pid, mode);
            holders = lock.cond.wait(holders).unwrap();
        }
        drop(holders);
        trace!("{} granted {:?} on page {}", tid, mode, pid);

        self.held.entry(tid).or_default().insert(pid);
    }

    /// Removes `tid`'s lock on `pid`, if any, and wakes all waiters on the
    /// page. Idempotent.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        self.release_on_page(tid, pid);
        if let Some(mut set) = self.held.get_mut(&tid) {
            set.remove(&pid);
        }
    }

    /// Releases every lock `tid` holds.
    pub fn release_all(&self, tid: TransactionId) {
        let pids = self
            .held
            .remove(&tid)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for pid in pids {
            self.release_on_page(tid, pid);
        }
    }

    /// True if `tid` holds a lock of any mode on `pid`.
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        self.holding(tid, pid).is_some()
    }

    /// The mode `tid` holds on `pid`, if any.
    pub fn holding(&self, tid: TransactionId, pid: PageId) -> Option<LockMode> {
        let lock = self.pages.get(&pid).map(|e| e.value().clone())?;
        let holders = lock.holders.lock().unwrap();
        holders.get(&tid).copied()
    }

    /// Pages `tid` currently holds locks on.
    pub fn held_pages(&self, tid: TransactionId) -> Vec<PageId> {
        self.held
            .get(&tid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn release_on_page(&self, tid: TransactionId, pid: PageId) {
        let Some(lock) = self.pages.get(&pid).map(|e| e.value().clone()) else {
            return;
        };
        let mut holders = lock.holders.lock().unwrap();
        if holders.remove(&tid).is_some() {
            trace!("{} released page {}", tid, pid);
            lock.cond.notify_all();
        }
    }
}

/// The grant rule. Mutates the holder set only when granting.
fn try_grant(
    holders: &mut HashMap<TransactionId, LockMode>,
    tid: TransactionId,
    mode: LockMode,
) -> bool {
    match holders.get(&tid).copied() {
        // An exclusive holder is re-granted any mode.
        Some(LockMode::Exclusive) => true,
        Some(LockMode::Shared) => match mode {
            LockMode::Shared => true,
            // Upgrade: only the sole holder may, atomically in place.
            LockMode::Exclusive => {
                if holders.len() == 1 {
                    holders.insert(tid, LockMode::Exclusive);
                    true
                } else {
                    false
                }
            }
        },
        None => match mode {
            LockMode::Exclusive => {
                if holders.is_empty() {
                    holders.insert(tid, mode);
                    true
                } else {
                    false
                }
            }
            LockMode::Shared => {
                if holders.values().any(|m| *m == LockMode::Exclusive) {
                    false
                } else {
                    holders.insert(tid, mode);
                    true
                }
            }
        },
    }
}
