//! Crash recovery in three passes.
//!
//! Analysis replays the log from the last checkpoint to find loser
//! transactions and the pages that may be stale on disk. Redo replays
//! every physical record from the oldest recovery LSN, skipping pages
//! whose stamped LSN already covers the record. Undo rolls back each
//! loser through its prev-LSN chain, logging a compensation record for
//! every step so an interrupted recovery resumes where it stopped.
//!
//! Index files are not logged; the engine rebuilds indexes from the
//! recovered heaps afterwards. Any I/O error or log corruption here is
//! fatal and surfaces as an error from `recover`.

use crate::access::heap::VersionedHeap;
use crate::access::tuple::TxnId;
use crate::recovery::checkpoint::{DirtyPageTable, TransactionTable};
use crate::storage::buffer::{BufferPoolManager, GlobalPageId};
use crate::storage::page;
use crate::storage::wal::{
    CompensationAction, Lsn, WalManager, WalPayload, WalRecord,
};
use crate::storage::{StorageError, StorageResult};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

/// Newest catalog image logged by a committed transaction, if any. The
/// engine installs this before opening table files, so a catalog file
/// write lost in a crash cannot leave the schema behind the data.
pub fn latest_committed_catalog_image(records: &[WalRecord]) -> Option<Vec<u8>> {
    let committed: HashSet<TxnId> = records
        .iter()
        .filter(|r| matches!(r.payload, WalPayload::Commit))
        .map(|r| r.txn_id())
        .collect();
    records.iter().rev().find_map(|r| match &r.payload {
        WalPayload::CatalogImage { image } if committed.contains(&r.txn_id()) => {
            Some(image.clone())
        }
        _ => None,
    })
}

/// What recovery found and did, for the engine and for logs.
#[derive(Debug)]
pub struct RecoveryReport {
    /// First transaction id the manager may hand out.
    pub next_txn_id: TxnId,
    /// Last record was a quiescent checkpoint; pages are trustworthy and
    /// index rebuild can be skipped.
    pub clean_shutdown: bool,
    pub redone: usize,
    pub undone_txns: usize,
}

pub struct RecoveryManager {
    wal: Arc<WalManager>,
    pool: BufferPoolManager,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WalManager>, pool: BufferPoolManager) -> Self {
        Self { wal, pool }
    }

    pub fn recover(&self) -> StorageResult<RecoveryReport> {
        let records = self.wal.read_all()?;
        let next_txn_id = records
            .iter()
            .map(|r| r.txn_id())
            .max()
            .map(|t| t + 1)
            .unwrap_or(1)
            .max(1);

        if let Some(WalRecord {
            payload: WalPayload::Checkpoint(payload),
            ..
        }) = records.last()
        {
            if payload.active_txns.is_empty() && payload.dirty_pages.is_empty() {
                log::info!("clean shutdown detected, skipping recovery passes");
                return Ok(RecoveryReport {
                    next_txn_id,
                    clean_shutdown: true,
                    redone: 0,
                    undone_txns: 0,
                });
            }
        }

        let (txn_table, dirty_pages) = Self::analysis(&records);
        log::info!(
            "analysis: {} loser transactions, {} possibly stale pages",
            txn_table.len(),
            dirty_pages.len()
        );

        let redone = self.redo(&records, &dirty_pages)?;
        let undone_txns = self.undo(&records, &txn_table)?;
        self.wal.flush_all()?;

        log::info!(
            "recovery complete: {} records redone, {} transactions rolled back",
            redone,
            undone_txns
        );
        Ok(RecoveryReport {
            next_txn_id,
            clean_shutdown: false,
            redone,
            undone_txns,
        })
    }

    /// Forward scan from the last checkpoint, rebuilding the transaction
    /// table and dirty page table.
    fn analysis(records: &[WalRecord]) -> (TransactionTable, DirtyPageTable) {
        let checkpoint = records
            .iter()
            .rev()
            .find_map(|r| match &r.payload {
                WalPayload::Checkpoint(payload) => Some((r.lsn(), payload)),
                _ => None,
            });

        let (start_lsn, mut txn_table, mut dirty_pages) = match checkpoint {
            Some((lsn, payload)) => (
                lsn,
                TransactionTable::from_checkpoint(payload),
                DirtyPageTable::from_checkpoint(payload),
            ),
            None => (Lsn::INVALID, TransactionTable::new(), DirtyPageTable::new()),
        };

        for record in records.iter().filter(|r| r.lsn() > start_lsn) {
            match &record.payload {
                WalPayload::Begin => txn_table.note_record(record.txn_id(), record.lsn()),
                WalPayload::Commit | WalPayload::Abort => txn_table.note_end(record.txn_id()),
                WalPayload::Checkpoint(_) => {}
                _ => {
                    txn_table.note_record(record.txn_id(), record.lsn());
                    if let Some(location) = record.location() {
                        dirty_pages.note_write(location.file, location.page, record.lsn());
                    }
                }
            }
        }
        (txn_table, dirty_pages)
    }

    /// Replay physical records forward from the oldest recovery LSN. A
    /// page already stamped at or past a record's LSN absorbed it before
    /// the crash; applying again would corrupt it.
    fn redo(&self, records: &[WalRecord], dirty_pages: &DirtyPageTable) -> StorageResult<usize> {
        let start = match dirty_pages.min_recovery_lsn() {
            Some(lsn) => lsn,
            None => return Ok(0),
        };

        let mut redone = 0;
        for record in records.iter().filter(|r| r.lsn() >= start) {
            let location = match record.location() {
                Some(l) => l,
                None => continue,
            };
            let gpid = GlobalPageId::new(location.file, location.page);

            match self.pool.ensure_page(gpid) {
                Ok(()) => {}
                // The file was dropped after this record was logged
                Err(StorageError::FileNotFound(_)) => {
                    log::warn!(
                        "skipping redo of LSN {}: file {} no longer exists",
                        record.lsn(),
                        location.file.0
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            {
                let guard = self.pool.fetch_page(gpid)?;
                if page::page_lsn(&guard) >= record.lsn().0 {
                    continue;
                }
            }

            let heap = VersionedHeap::new(self.pool.clone(), location.file);
            match &record.payload {
                WalPayload::Insert { after, .. } => {
                    heap.restore_at(location, after, record.lsn())?;
                }
                WalPayload::Update { after, .. } => {
                    heap.restore_at(location, after, record.lsn())?;
                }
                WalPayload::Delete { .. } => {
                    heap.set_xmax(location, record.txn_id(), record.lsn())?;
                }
                WalPayload::Compensation { action, .. } => match action {
                    CompensationAction::RemoveTuple { location } => {
                        heap.remove(*location, record.lsn())?;
                    }
                    CompensationAction::RestoreTuple { location, image } => {
                        heap.restore_at(*location, image, record.lsn())?;
                    }
                },
                _ => continue,
            }
            redone += 1;
        }
        Ok(redone)
    }

    /// Roll back every loser, newest record first across all of them.
    /// Compensation records encountered in a chain are not re-applied;
    /// they redirect to the next record still needing undo, so a crash
    /// during a previous undo never repeats work.
    fn undo(&self, records: &[WalRecord], txn_table: &TransactionTable) -> StorageResult<usize> {
        let by_lsn: HashMap<Lsn, &WalRecord> = records.iter().map(|r| (r.lsn(), r)).collect();

        let mut last_lsn: HashMap<TxnId, Lsn> = HashMap::new();
        let mut pending: BinaryHeap<Lsn> = BinaryHeap::new();
        for (txn_id, lsn) in txn_table.losers() {
            last_lsn.insert(txn_id, lsn);
            pending.push(lsn);
        }
        let undone_txns = last_lsn.len();

        while let Some(lsn) = pending.pop() {
            let record = by_lsn.get(&lsn).ok_or_else(|| {
                StorageError::Corruption(format!("undo chain points at missing LSN {}", lsn))
            })?;
            let txn_id = record.txn_id();

            let next = match &record.payload {
                WalPayload::Begin => {
                    self.finish_loser(txn_id, &last_lsn)?;
                    continue;
                }
                WalPayload::Compensation { undo_next_lsn, .. } => *undo_next_lsn,
                _ => {
                    if let Some(action) = record.undo_action() {
                        let prev = last_lsn.get(&txn_id).copied().unwrap_or(Lsn::INVALID);
                        let clr = self.wal.append(
                            txn_id,
                            prev,
                            WalPayload::Compensation {
                                undo_next_lsn: record.header.prev_lsn,
                                action: action.clone(),
                            },
                        )?;
                        last_lsn.insert(txn_id, clr);
                        self.apply_compensation(&action, clr)?;
                    }
                    record.header.prev_lsn
                }
            };

            if next.is_invalid() {
                self.finish_loser(txn_id, &last_lsn)?;
            } else {
                pending.push(next);
            }
        }
        Ok(undone_txns)
    }

    fn finish_loser(&self, txn_id: TxnId, last_lsn: &HashMap<TxnId, Lsn>) -> StorageResult<()> {
        let prev = last_lsn.get(&txn_id).copied().unwrap_or(Lsn::INVALID);
        self.wal.append(txn_id, prev, WalPayload::Abort)?;
        log::debug!("rolled back loser transaction {}", txn_id);
        Ok(())
    }

    fn apply_compensation(&self, action: &CompensationAction, lsn: Lsn) -> StorageResult<()> {
        let location = action.location();
        let heap = VersionedHeap::new(self.pool.clone(), location.file);
        match action {
            CompensationAction::RemoveTuple { .. } => heap.remove(location, lsn),
            CompensationAction::RestoreTuple { image, .. } => {
                heap.overwrite(location, image, lsn)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tuple::{Tuple, VersionHeader};
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::disk::PageStore;
    use crate::storage::page::{FileId, PageId};
    use crate::storage::wal::RowLocation;
    use std::path::Path;
    use tempfile::tempdir;

    const TABLE: FileId = FileId(1);

    fn fresh_pool(dir: &Path) -> BufferPoolManager {
        let pool = BufferPoolManager::new(Box::new(LruReplacer::new(64)), 64);
        pool.register_file(TABLE, PageStore::open(&dir.join("t.db")).unwrap());
        pool
    }

    fn tuple_bytes(xmin: TxnId, payload: &[u8]) -> Vec<u8> {
        Tuple::new(VersionHeader::new(xmin), payload.to_vec()).encode()
    }

    #[test]
    fn test_committed_insert_survives_crash() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        // Log a committed insert whose page never reached disk
        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let l1 = wal.append(1, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(
                1,
                l1,
                WalPayload::Insert {
                    location: RowLocation::new(TABLE, PageId(1), 0),
                    after: tuple_bytes(1, b"survivor"),
                },
            )?;
            let l3 = wal.append(1, l2, WalPayload::Commit)?;
            wal.flush_up_to(l3)?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal, pool.clone()).recover()?;
        assert!(!report.clean_shutdown);
        assert_eq!(report.next_txn_id, 2);
        assert_eq!(report.undone_txns, 0);
        assert!(report.redone >= 1);

        let heap = VersionedHeap::new(pool, TABLE);
        let rows: Vec<_> = heap.scan()?.collect::<StorageResult<Vec<_>>>()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.payload, b"survivor");
        Ok(())
    }

    #[test]
    fn test_loser_is_rolled_back() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let l1 = wal.append(1, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(
                1,
                l1,
                WalPayload::Insert {
                    location: RowLocation::new(TABLE, PageId(1), 0),
                    after: tuple_bytes(1, b"doomed"),
                },
            )?;
            // No commit record: the transaction loses
            wal.flush_up_to(l2)?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal.clone(), pool.clone()).recover()?;
        assert_eq!(report.undone_txns, 1);

        let heap = VersionedHeap::new(pool, TABLE);
        assert_eq!(heap.scan()?.count(), 0);

        // Undo left a compensation record and closed the loser
        let records = wal.read_all()?;
        assert!(records
            .iter()
            .any(|r| matches!(r.payload, WalPayload::Compensation { .. })));
        assert!(records
            .iter()
            .any(|r| r.txn_id() == 1 && r.payload == WalPayload::Abort));
        Ok(())
    }

    #[test]
    fn test_loser_delete_is_restored() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        let before = tuple_bytes(1, b"kept");
        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let l1 = wal.append(1, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(
                1,
                l1,
                WalPayload::Insert {
                    location: RowLocation::new(TABLE, PageId(1), 0),
                    after: before.clone(),
                },
            )?;
            let l3 = wal.append(1, l2, WalPayload::Commit)?;

            // A second transaction deletes the row but never commits
            let l4 = wal.append(2, Lsn::INVALID, WalPayload::Begin)?;
            let l5 = wal.append(
                2,
                l4,
                WalPayload::Delete {
                    location: RowLocation::new(TABLE, PageId(1), 0),
                    before: before.clone(),
                },
            )?;
            let _ = l3;
            wal.flush_up_to(l5)?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal, pool.clone()).recover()?;
        assert_eq!(report.undone_txns, 1);

        let heap = VersionedHeap::new(pool, TABLE);
        let rows: Vec<_> = heap.scan()?.collect::<StorageResult<Vec<_>>>()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.header.xmax, 0);
        Ok(())
    }

    #[test]
    fn test_interrupted_undo_resumes_via_compensation_chain() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let loc_a = RowLocation::new(TABLE, PageId(1), 0);
            let loc_b = RowLocation::new(TABLE, PageId(1), 1);
            let l1 = wal.append(1, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(
                1,
                l1,
                WalPayload::Insert {
                    location: loc_a,
                    after: tuple_bytes(1, b"a"),
                },
            )?;
            let l3 = wal.append(
                1,
                l2,
                WalPayload::Insert {
                    location: loc_b,
                    after: tuple_bytes(1, b"b"),
                },
            )?;
            // A previous recovery undid the second insert, then crashed
            let l4 = wal.append(
                1,
                l3,
                WalPayload::Compensation {
                    undo_next_lsn: l2,
                    action: CompensationAction::RemoveTuple { location: loc_b },
                },
            )?;
            wal.flush_up_to(l4)?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal.clone(), pool.clone()).recover()?;
        assert_eq!(report.undone_txns, 1);

        // Both inserts are gone and the loser is closed
        let heap = VersionedHeap::new(pool, TABLE);
        assert_eq!(heap.scan()?.count(), 0);
        let records = wal.read_all()?;
        assert!(records
            .iter()
            .any(|r| r.txn_id() == 1 && r.payload == WalPayload::Abort));
        Ok(())
    }

    #[test]
    fn test_recovery_is_idempotent() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let l1 = wal.append(1, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(
                1,
                l1,
                WalPayload::Insert {
                    location: RowLocation::new(TABLE, PageId(1), 0),
                    after: tuple_bytes(1, b"once"),
                },
            )?;
            let l3 = wal.append(1, l2, WalPayload::Commit)?;
            wal.flush_up_to(l3)?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        RecoveryManager::new(wal.clone(), pool.clone()).recover()?;
        // A second pass over the same log must not duplicate anything
        RecoveryManager::new(wal, pool.clone()).recover()?;

        let heap = VersionedHeap::new(pool, TABLE);
        assert_eq!(heap.scan()?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_clean_shutdown_skips_passes() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;

        {
            let wal = WalManager::create(&dir.path().join("wal.log"))?;
            let l1 = wal.append(3, Lsn::INVALID, WalPayload::Begin)?;
            let l2 = wal.append(3, l1, WalPayload::Commit)?;
            wal.flush_up_to(l2)?;
            wal.checkpoint(Vec::new(), Vec::new())?;
        }

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal, pool).recover()?;
        assert!(report.clean_shutdown);
        assert_eq!(report.next_txn_id, 4);
        assert_eq!(report.redone, 0);
        Ok(())
    }

    #[test]
    fn test_latest_committed_catalog_image_ignores_losers() {
        use crate::storage::wal::WalRecordHeader;

        let mk = |lsn: u64, prev: u64, txn: TxnId, payload: WalPayload| WalRecord {
            header: WalRecordHeader {
                lsn: Lsn(lsn),
                prev_lsn: Lsn(prev),
                txn_id: txn,
            },
            payload,
        };
        let records = vec![
            mk(1, 0, 1, WalPayload::Begin),
            mk(2, 1, 1, WalPayload::CatalogImage { image: vec![1] }),
            mk(3, 2, 1, WalPayload::Commit),
            mk(4, 0, 2, WalPayload::Begin),
            // Txn 2 logged a newer image but never committed
            mk(5, 4, 2, WalPayload::CatalogImage { image: vec![2] }),
        ];
        assert_eq!(latest_committed_catalog_image(&records), Some(vec![1]));
        assert_eq!(latest_committed_catalog_image(&[]), None);
    }

    #[test]
    fn test_empty_log() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        PageStore::create(&dir.path().join("t.db"))?;
        WalManager::create(&dir.path().join("wal.log"))?;

        let pool = fresh_pool(dir.path());
        let wal = Arc::new(WalManager::open(&dir.path().join("wal.log"))?);
        let report = RecoveryManager::new(wal, pool).recover()?;
        assert_eq!(report.next_txn_id, 1);
        assert_eq!(report.redone, 0);
        assert_eq!(report.undone_txns, 0);
        Ok(())
    }
}
