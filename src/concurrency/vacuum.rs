//! Version reclamation.
//!
//! A version whose deleter committed below the reclaim horizon (the
//! oldest snapshot xmin any active transaction holds) can never become
//! visible again; vacuum removes it from its heap and indexes and
//! unthreads it from version chains. Runs on demand or as a background
//! thread that shares nothing with the engine beyond the published
//! horizon.

use crate::concurrency::mvcc::{decode_row, TableRegistry, TransactionManager};
use crate::storage::wal::Lsn;
use crate::storage::StorageResult;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Vacuum {
    manager: Arc<TransactionManager>,
    registry: Arc<TableRegistry>,
}

impl Vacuum {
    pub fn new(manager: Arc<TransactionManager>, registry: Arc<TableRegistry>) -> Self {
        Self { manager, registry }
    }

    /// One reclamation pass over every table. Returns the number of
    /// versions physically removed.
    pub fn run_once(&self) -> StorageResult<usize> {
        let horizon = self.manager.horizon();
        let mut reclaimed = 0;
        // Transaction ids stamped on versions that survive this pass;
        // conflict-table pruning must keep these distinguishable
        let mut stamped = HashSet::new();

        for file in self.registry.files() {
            let (heap, primary, secondaries) = self.registry.get(file)?;

            let mut victims = Vec::new();
            for item in heap.scan()? {
                let (row, tuple) = item?;
                let xmax = tuple.header.xmax;
                if xmax != 0 && xmax < horizon && self.manager.is_committed(xmax) {
                    victims.push((row, tuple));
                } else {
                    stamped.insert(tuple.header.xmin);
                    if xmax != 0 {
                        stamped.insert(xmax);
                    }
                }
            }

            let mut removed = HashSet::new();
            for (row, tuple) in &victims {
                let (key, value) = decode_row(&tuple.payload)?;
                primary.delete(&key, *row)?;
                for secondary in &secondaries {
                    secondary.index.delete(&value, *row)?;
                }
                heap.remove(*row, Lsn::INVALID)?;
                removed.insert((row.page, row.slot));
                reclaimed += 1;
            }

            if removed.is_empty() {
                continue;
            }
            // Unthread chains: survivors pointing at a reclaimed version
            // lose their back-pointer
            for item in heap.scan()? {
                let (row, mut tuple) = item?;
                if let Some(prev) = tuple.header.prev {
                    if removed.contains(&prev) {
                        tuple.header.prev = None;
                        heap.overwrite(row, &tuple.encode(), Lsn::INVALID)?;
                    }
                }
            }
        }

        self.manager.prune_conflict_tables(&stamped);

        if reclaimed > 0 {
            log::info!("vacuum reclaimed {} versions below txn {}", reclaimed, horizon);
        }
        Ok(reclaimed)
    }
}

/// Background vacuum thread with a fixed period.
pub struct VacuumWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl VacuumWorker {
    pub fn spawn(vacuum: Vacuum, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(period);
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = vacuum.run_once() {
                    log::warn!("vacuum pass failed: {}", e);
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VacuumWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::BTreeIndex;
    use crate::access::heap::VersionedHeap;
    use crate::concurrency::mvcc::TableSet;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::buffer::BufferPoolManager;
    use crate::storage::disk::PageStore;
    use crate::storage::page::FileId;
    use crate::storage::wal::WalManager;
    use tempfile::{tempdir, TempDir};

    const TABLE: FileId = FileId(1);
    const INDEX: FileId = FileId(2);

    fn setup() -> (Arc<TransactionManager>, Arc<TableRegistry>, TempDir) {
        let dir = tempdir().unwrap();
        let pool = BufferPoolManager::new(Box::new(LruReplacer::new(64)), 64);
        pool.register_file(TABLE, PageStore::create(&dir.path().join("t.db")).unwrap());
        pool.register_file(INDEX, PageStore::create(&dir.path().join("i.db")).unwrap());
        let wal = Arc::new(WalManager::create(&dir.path().join("wal.log")).unwrap());
        pool.attach_wal(wal.clone());

        let registry = Arc::new(TableRegistry::new());
        registry.register(
            TABLE,
            TableSet {
                heap: Arc::new(VersionedHeap::new(pool.clone(), TABLE)),
                primary: Arc::new(BTreeIndex::create(pool.clone(), INDEX).unwrap()),
                secondaries: Vec::new(),
            },
        );
        let manager = Arc::new(TransactionManager::new(wal, registry.clone(), 1));
        (manager, registry, dir)
    }

    #[test]
    fn test_reclaims_dead_versions() -> StorageResult<()> {
        let (mgr, registry, _dir) = setup();
        let vacuum = Vacuum::new(mgr.clone(), registry.clone());

        let t1 = mgr.begin()?;
        mgr.insert(t1, TABLE, b"k1", b"a")?;
        mgr.commit(t1)?;

        let t2 = mgr.begin()?;
        mgr.update(t2, TABLE, b"k1", b"b")?;
        mgr.commit(t2)?;

        // No active transaction can still see the old version
        assert_eq!(vacuum.run_once()?, 1);

        let (heap, _, _) = registry.get(TABLE)?;
        let live: Vec<_> = heap.scan()?.collect::<StorageResult<Vec<_>>>()?;
        assert_eq!(live.len(), 1);
        assert!(live[0].1.header.prev.is_none());

        let t3 = mgr.begin()?;
        assert_eq!(mgr.get(t3, TABLE, b"k1")?, Some(b"b".to_vec()));
        Ok(())
    }

    #[test]
    fn test_never_reclaims_under_active_snapshot() -> StorageResult<()> {
        let (mgr, registry, _dir) = setup();
        let vacuum = Vacuum::new(mgr.clone(), registry.clone());

        let t1 = mgr.begin()?;
        mgr.insert(t1, TABLE, b"k1", b"a")?;
        mgr.commit(t1)?;

        // Old snapshot still needs the original version
        let old_reader = mgr.begin()?;

        let t2 = mgr.begin()?;
        mgr.update(t2, TABLE, b"k1", b"b")?;
        mgr.commit(t2)?;

        assert_eq!(vacuum.run_once()?, 0);
        assert_eq!(mgr.get(old_reader, TABLE, b"k1")?, Some(b"a".to_vec()));

        mgr.commit(old_reader)?;
        assert_eq!(vacuum.run_once()?, 1);
        Ok(())
    }

    #[test]
    fn test_live_rows_survive() -> StorageResult<()> {
        let (mgr, registry, _dir) = setup();
        let vacuum = Vacuum::new(mgr.clone(), registry.clone());

        let t1 = mgr.begin()?;
        mgr.insert(t1, TABLE, b"k1", b"a")?;
        mgr.insert(t1, TABLE, b"k2", b"b")?;
        mgr.commit(t1)?;

        assert_eq!(vacuum.run_once()?, 0);

        let t2 = mgr.begin()?;
        assert_eq!(mgr.scan(t2, TABLE)?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_pass_prunes_conflict_state() -> StorageResult<()> {
        let (mgr, registry, _dir) = setup();
        let vacuum = Vacuum::new(mgr.clone(), registry.clone());

        let t1 = mgr.begin()?;
        mgr.insert(t1, TABLE, b"k1", b"a")?;
        mgr.commit(t1)?;

        let t2 = mgr.begin()?;
        mgr.update(t2, TABLE, b"k1", b"b")?;
        mgr.commit(t2)?;

        // Reclaims the overwritten version and, with no active
        // transactions left, drops the per-row committer entries
        assert_eq!(vacuum.run_once()?, 1);
        assert!(!mgr.tracks_row_committer(TABLE, b"k1"));

        let t3 = mgr.begin()?;
        assert_eq!(mgr.get(t3, TABLE, b"k1")?, Some(b"b".to_vec()));
        Ok(())
    }
}
