//! Page-level latches for B-tree traversal.
//!
//! One reader-writer latch per page, created on first use. Descents use
//! latch coupling: the parent's latch is held until the child's latch is
//! acquired. Writers latch top-down and keep ancestors latched only
//! while a structural change may still propagate upward, which fixes the
//! acquisition order and rules out latch deadlock.

use crate::storage::page::PageId;
use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::Arc;

pub enum PageLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

#[derive(Default)]
pub struct LatchManager {
    latches: DashMap<PageId, Arc<RwLock<()>>>,
}

impl LatchManager {
    pub fn new() -> Self {
        Self {
            latches: DashMap::new(),
        }
    }

    fn latch_for(&self, page_id: PageId) -> Arc<RwLock<()>> {
        self.latches
            .entry(page_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn shared(&self, page_id: PageId) -> PageLatch {
        PageLatch::Shared(self.latch_for(page_id).read_arc())
    }

    pub fn exclusive(&self, page_id: PageId) -> PageLatch {
        PageLatch::Exclusive(self.latch_for(page_id).write_arc())
    }

    /// Drop bookkeeping for a page that was freed.
    pub fn forget(&self, page_id: PageId) {
        self.latches.remove(&page_id);
    }
}

/// Stack of latches held along a root-to-leaf path.
pub struct LatchCoupling {
    held: Vec<PageLatch>,
}

impl LatchCoupling {
    pub fn new() -> Self {
        Self { held: Vec::new() }
    }

    pub fn push(&mut self, latch: PageLatch) {
        self.held.push(latch);
    }

    /// Release every ancestor, keeping only the most recent latch.
    /// Called once the newly latched child is known to be safe (no
    /// split or merge can propagate above it).
    pub fn release_ancestors(&mut self) {
        if self.held.len() > 1 {
            self.held.drain(..self.held.len() - 1);
        }
    }

    pub fn release_all(&mut self) {
        self.held.clear();
    }

    pub fn depth(&self) -> usize {
        self.held.len()
    }
}

impl Default for LatchCoupling {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_latches_coexist() {
        let manager = LatchManager::new();
        let a = manager.shared(PageId(1));
        let b = manager.shared(PageId(1));
        drop(a);
        drop(b);
    }

    #[test]
    fn test_exclusive_latch_blocks_shared() {
        let manager = Arc::new(LatchManager::new());
        let held = manager.exclusive(PageId(1));

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let manager = manager.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let _latch = manager.shared(PageId(1));
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(held);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_coupling_keeps_only_newest() {
        let manager = LatchManager::new();
        let mut coupling = LatchCoupling::new();
        coupling.push(manager.shared(PageId(1)));
        coupling.push(manager.shared(PageId(2)));
        coupling.release_ancestors();
        assert_eq!(coupling.depth(), 1);

        // The parent latch is free again
        let parent = manager.exclusive(PageId(1));
        drop(parent);
        coupling.release_all();
        assert_eq!(coupling.depth(), 0);
    }
}
