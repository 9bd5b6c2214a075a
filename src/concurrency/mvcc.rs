//! MVCC transaction manager.
//!
//! Snapshot isolation over versioned heaps: readers never block, writers
//! never block, and write-write conflicts surface as
//! `SerializationConflict`, eagerly when the overwritten version carries
//! an uncommitted delete stamp, or at commit through the
//! first-committer-wins check. Commit durability is the WAL flush of the
//! commit record; abort undoes the transaction's own versions through
//! compensation records so a crash mid-abort resumes cleanly.

use crate::access::btree::BTreeIndex;
use crate::access::heap::VersionedHeap;
use crate::access::tuple::{RowId, Tuple, TxnId, VersionHeader};
use crate::concurrency::snapshot::Snapshot;
use crate::storage::page::FileId;
use crate::storage::wal::{CompensationAction, Lsn, WalManager, WalPayload};
use crate::storage::{StorageError, StorageResult};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Secondary index over the row value bytes.
#[derive(Clone)]
pub struct SecondaryIndex {
    pub name: String,
    pub index: Arc<BTreeIndex>,
    pub unique: bool,
}

/// The heap and indexes backing one table.
pub struct TableSet {
    pub heap: Arc<VersionedHeap>,
    pub primary: Arc<BTreeIndex>,
    pub secondaries: Vec<SecondaryIndex>,
}

/// Open tables keyed by heap file, shared by the transaction manager,
/// vacuum, and the engine.
#[derive(Default)]
pub struct TableRegistry {
    tables: DashMap<FileId, TableSet>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    pub fn register(&self, file: FileId, set: TableSet) {
        self.tables.insert(file, set);
    }

    pub fn unregister(&self, file: FileId) {
        self.tables.remove(&file);
    }

    pub fn add_secondary(&self, file: FileId, secondary: SecondaryIndex) -> StorageResult<()> {
        let mut set = self
            .tables
            .get_mut(&file)
            .ok_or(StorageError::FileNotFound(file.0))?;
        set.secondaries.push(secondary);
        Ok(())
    }

    pub fn remove_secondary(&self, file: FileId, name: &str) -> StorageResult<()> {
        let mut set = self
            .tables
            .get_mut(&file)
            .ok_or(StorageError::FileNotFound(file.0))?;
        set.secondaries.retain(|s| s.name != name);
        Ok(())
    }

    /// Clone out the handles for one table.
    pub fn get(
        &self,
        file: FileId,
    ) -> StorageResult<(Arc<VersionedHeap>, Arc<BTreeIndex>, Vec<SecondaryIndex>)> {
        let set = self
            .tables
            .get(&file)
            .ok_or(StorageError::FileNotFound(file.0))?;
        Ok((
            set.heap.clone(),
            set.primary.clone(),
            set.secondaries.clone(),
        ))
    }

    pub fn files(&self) -> Vec<FileId> {
        self.tables.iter().map(|e| *e.key()).collect()
    }
}

/// Row payload stored in the heap: key length, key bytes, value bytes.
/// Keeping the key inside the stored row lets vacuum and index rebuild
/// recover index entries from the heap alone.
pub fn encode_row(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

pub fn decode_row(payload: &[u8]) -> StorageResult<(Vec<u8>, Vec<u8>)> {
    if payload.len() < 4 {
        return Err(StorageError::Corruption("row payload too short".into()));
    }
    let key_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + key_len {
        return Err(StorageError::Corruption(
            "row payload truncated inside key".into(),
        ));
    }
    Ok((
        payload[4..4 + key_len].to_vec(),
        payload[4 + key_len..].to_vec(),
    ))
}

enum WriteKind {
    /// A version this transaction created.
    Insert { row: RowId, value: Vec<u8> },
    /// An existing version this transaction stamped its xmax on.
    Stamp { row: RowId, before: Vec<u8> },
}

struct WriteRecord {
    table: FileId,
    key: Vec<u8>,
    kind: WriteKind,
    lsn: Lsn,
}

struct Transaction {
    id: TxnId,
    snapshot: Snapshot,
    /// Commit sequence at begin; the first-committer-wins baseline.
    start_seq: u64,
    begin_lsn: Lsn,
    last_lsn: Lsn,
    writes: Vec<WriteRecord>,
}

struct ManagerState {
    next_txn_id: TxnId,
    active: HashMap<TxnId, Transaction>,
}

pub struct TransactionManager {
    wal: Arc<WalManager>,
    registry: Arc<TableRegistry>,
    state: Mutex<ManagerState>,
    /// Lock-free mirror of the active transaction ids, for visibility
    /// checks on read paths.
    active_ids: DashSet<TxnId>,
    aborted: DashSet<TxnId>,
    commit_seq: AtomicU64,
    /// (heap file, row key) -> commit sequence of the last committer.
    row_committers: DashMap<(u32, Vec<u8>), u64>,
    sync_commits: bool,
}

impl TransactionManager {
    /// `next_txn_id` must exceed every transaction id recorded in the
    /// WAL; recovery computes it before the manager starts.
    pub fn new(wal: Arc<WalManager>, registry: Arc<TableRegistry>, next_txn_id: TxnId) -> Self {
        Self {
            wal,
            registry,
            state: Mutex::new(ManagerState {
                next_txn_id: next_txn_id.max(1),
                active: HashMap::new(),
            }),
            active_ids: DashSet::new(),
            aborted: DashSet::new(),
            commit_seq: AtomicU64::new(0),
            row_committers: DashMap::new(),
            sync_commits: true,
        }
    }

    /// Disable the WAL flush at commit. Commits may be lost in a crash;
    /// atomicity is unaffected.
    pub fn set_sync_commits(&mut self, sync: bool) {
        self.sync_commits = sync;
    }

    pub fn begin(&self) -> StorageResult<TxnId> {
        let mut state = self.state.lock();
        let id = state.next_txn_id;
        state.next_txn_id += 1;

        let active: HashSet<TxnId> = state.active.keys().copied().collect();
        let xmin = active.iter().copied().min().unwrap_or(id);
        let snapshot = Snapshot {
            xmin,
            xmax: id + 1,
            active,
        };
        let begin_lsn = self.wal.append(id, Lsn::INVALID, WalPayload::Begin)?;

        state.active.insert(
            id,
            Transaction {
                id,
                snapshot,
                start_seq: self.commit_seq.load(Ordering::SeqCst),
                begin_lsn,
                last_lsn: begin_lsn,
                writes: Vec::new(),
            },
        );
        self.active_ids.insert(id);
        Ok(id)
    }

    fn snapshot_of(&self, txn_id: TxnId) -> StorageResult<Snapshot> {
        let state = self.state.lock();
        let txn = state
            .active
            .get(&txn_id)
            .ok_or(StorageError::TxnNotActive(txn_id))?;
        Ok(txn.snapshot.clone())
    }

    /// A transaction that is neither active nor aborted has committed.
    /// Losers from before a restart never survive recovery, so an
    /// unknown id from an earlier epoch is committed too.
    pub fn is_committed(&self, txn_id: TxnId) -> bool {
        txn_id != 0 && !self.active_ids.contains(&txn_id) && !self.aborted.contains(&txn_id)
    }

    fn txn_visible(&self, viewer: TxnId, snapshot: &Snapshot, txn_id: TxnId) -> bool {
        txn_id == viewer || (snapshot.permits(txn_id) && self.is_committed(txn_id))
    }

    /// Full snapshot-isolation visibility of one version.
    pub fn version_visible(
        &self,
        viewer: TxnId,
        snapshot: &Snapshot,
        header: &VersionHeader,
    ) -> VersionView {
        if !self.txn_visible(viewer, snapshot, header.xmin) {
            return VersionView::Invisible;
        }
        if header.xmax != 0 && self.txn_visible(viewer, snapshot, header.xmax) {
            return VersionView::Deleted;
        }
        VersionView::Visible
    }

    /// Newest version of `key` visible to the transaction, with its
    /// address. `Deleted` outcomes short-circuit to None: the row is
    /// gone for this snapshot.
    fn find_visible(
        &self,
        viewer: TxnId,
        snapshot: &Snapshot,
        heap: &VersionedHeap,
        primary: &BTreeIndex,
        key: &[u8],
    ) -> StorageResult<Option<(RowId, Tuple)>> {
        let rows = primary.lookup(key)?;
        for row in rows.iter().rev() {
            let tuple = match heap.read(*row)? {
                Some(t) => t,
                None => continue,
            };
            match self.version_visible(viewer, snapshot, &tuple.header) {
                VersionView::Invisible => continue,
                VersionView::Deleted => return Ok(None),
                VersionView::Visible => return Ok(Some((*row, tuple))),
            }
        }
        Ok(None)
    }

    pub fn get(
        &self,
        txn_id: TxnId,
        table: FileId,
        key: &[u8],
    ) -> StorageResult<Option<Vec<u8>>> {
        let snapshot = self.snapshot_of(txn_id)?;
        let (heap, primary, _) = self.registry.get(table)?;
        match self.find_visible(txn_id, &snapshot, &heap, &primary, key)? {
            Some((_, tuple)) => {
                let (_, value) = decode_row(&tuple.payload)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Insert a new row. The key must not be visible to the transaction.
    pub fn insert(
        &self,
        txn_id: TxnId,
        table: FileId,
        key: &[u8],
        value: &[u8],
    ) -> StorageResult<()> {
        let snapshot = self.snapshot_of(txn_id)?;
        let (heap, primary, secondaries) = self.registry.get(table)?;

        if self
            .find_visible(txn_id, &snapshot, &heap, &primary, key)?
            .is_some()
        {
            return Err(StorageError::ConstraintViolation(format!(
                "duplicate key in table {}",
                table.0
            )));
        }
        self.check_unique_secondaries(txn_id, &snapshot, &heap, &secondaries, value)?;

        // Chain the new version ahead of the newest existing one
        let prev = primary
            .lookup(key)?
            .last()
            .map(|row| (row.page, row.slot));
        let header = match prev {
            Some(p) => VersionHeader::with_prev(txn_id, p),
            None => VersionHeader::new(txn_id),
        };
        let tuple = Tuple::new(header, encode_row(key, value));

        self.apply_insert(txn_id, table, key, value, &heap, &primary, &secondaries, tuple)
    }

    /// Replace the visible row under `key`. Returns false if there is
    /// no visible row.
    pub fn update(
        &self,
        txn_id: TxnId,
        table: FileId,
        key: &[u8],
        value: &[u8],
    ) -> StorageResult<bool> {
        let snapshot = self.snapshot_of(txn_id)?;
        let (heap, primary, secondaries) = self.registry.get(table)?;

        let (old_row, old_tuple) =
            match self.find_visible(txn_id, &snapshot, &heap, &primary, key)? {
                Some(found) => found,
                None => return Ok(false),
            };
        self.check_unique_secondaries(txn_id, &snapshot, &heap, &secondaries, value)?;
        self.stamp_xmax(txn_id, table, key, &heap, old_row, &old_tuple)?;

        let header = VersionHeader::with_prev(txn_id, (old_row.page, old_row.slot));
        let tuple = Tuple::new(header, encode_row(key, value));
        self.apply_insert(txn_id, table, key, value, &heap, &primary, &secondaries, tuple)?;
        Ok(true)
    }

    /// Delete the visible row under `key`. Returns false if there is no
    /// visible row.
    pub fn delete(&self, txn_id: TxnId, table: FileId, key: &[u8]) -> StorageResult<bool> {
        let snapshot = self.snapshot_of(txn_id)?;
        let (heap, primary, _) = self.registry.get(table)?;

        let (old_row, old_tuple) =
            match self.find_visible(txn_id, &snapshot, &heap, &primary, key)? {
                Some(found) => found,
                None => return Ok(false),
            };
        self.stamp_xmax(txn_id, table, key, &heap, old_row, &old_tuple)?;
        Ok(true)
    }

    /// Visible rows of a table in key order, as a lazy cursor. The
    /// cursor re-seeks the primary index between steps instead of
    /// pinning pages, so it stays valid across concurrent structural
    /// changes.
    pub fn scan(&self, txn_id: TxnId, table: FileId) -> StorageResult<ScanCursor<'_>> {
        let snapshot = self.snapshot_of(txn_id)?;
        let (heap, primary, _) = self.registry.get(table)?;
        Ok(ScanCursor {
            manager: self,
            heap,
            primary,
            txn_id,
            snapshot,
            after: None,
            done: false,
        })
    }

    /// Append the serialized catalog to the transaction's WAL chain.
    /// Schema-changing commits log this before their commit record so
    /// recovery can reinstall the image even when the catalog file write
    /// never happens.
    pub fn log_catalog_image(&self, txn_id: TxnId, image: Vec<u8>) -> StorageResult<()> {
        let mut state = self.state.lock();
        let txn = state
            .active
            .get_mut(&txn_id)
            .ok_or(StorageError::TxnNotActive(txn_id))?;
        let lsn = self
            .wal
            .append(txn_id, txn.last_lsn, WalPayload::CatalogImage { image })?;
        txn.last_lsn = lsn;
        Ok(())
    }

    /// Commit: first-committer-wins check, commit record, and commit
    /// sequence publication in one critical section, then the WAL flush
    /// (the durability point). Check and publication must not be split:
    /// two conflicting transactions could otherwise both pass the check
    /// before either publishes. A conflict leaves the transaction active
    /// for the caller to abort.
    pub fn commit(&self, txn_id: TxnId) -> StorageResult<()> {
        let commit_lsn = {
            let mut state = self.state.lock();
            let txn = state
                .active
                .get(&txn_id)
                .ok_or(StorageError::TxnNotActive(txn_id))?;

            for write in &txn.writes {
                let committed = self
                    .row_committers
                    .get(&(write.table.0, write.key.clone()))
                    .map(|e| *e.value());
                if let Some(seq) = committed {
                    if seq > txn.start_seq {
                        return Err(StorageError::SerializationConflict);
                    }
                }
            }
            let commit_lsn = self.wal.append(txn_id, txn.last_lsn, WalPayload::Commit)?;

            let txn = state
                .active
                .remove(&txn_id)
                .ok_or(StorageError::TxnNotActive(txn_id))?;
            let seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
            for write in &txn.writes {
                self.row_committers
                    .insert((write.table.0, write.key.clone()), seq);
            }
            self.active_ids.remove(&txn_id);
            commit_lsn
        };

        if self.sync_commits {
            self.wal.flush_up_to(commit_lsn)?;
        }
        log::debug!("txn {} committed at LSN {}", txn_id, commit_lsn);
        Ok(())
    }

    /// Roll back: undo the transaction's own writes newest-first, each
    /// step logged as a compensation record before the page changes.
    pub fn abort(&self, txn_id: TxnId) -> StorageResult<()> {
        let mut txn = {
            let mut state = self.state.lock();
            let txn = state
                .active
                .remove(&txn_id)
                .ok_or(StorageError::TxnNotActive(txn_id))?;
            // Aborted before leaving the active set, so no reader ever
            // takes this id for committed
            self.aborted.insert(txn_id);
            self.active_ids.remove(&txn_id);
            txn
        };

        for i in (0..txn.writes.len()).rev() {
            let undo_next = if i > 0 {
                txn.writes[i - 1].lsn
            } else {
                txn.begin_lsn
            };
            let write = &txn.writes[i];
            let (heap, primary, secondaries) = self.registry.get(write.table)?;
            match &write.kind {
                WriteKind::Insert { row, value } => {
                    let clr = self.wal.append(
                        txn_id,
                        txn.last_lsn,
                        WalPayload::Compensation {
                            undo_next_lsn: undo_next,
                            action: CompensationAction::RemoveTuple { location: *row },
                        },
                    )?;
                    heap.remove(*row, clr)?;
                    primary.delete(&write.key, *row)?;
                    for secondary in &secondaries {
                        secondary.index.delete(value, *row)?;
                    }
                    txn.last_lsn = clr;
                }
                WriteKind::Stamp { row, before } => {
                    let clr = self.wal.append(
                        txn_id,
                        txn.last_lsn,
                        WalPayload::Compensation {
                            undo_next_lsn: undo_next,
                            action: CompensationAction::RestoreTuple {
                                location: *row,
                                image: before.clone(),
                            },
                        },
                    )?;
                    heap.overwrite(*row, before, clr)?;
                    txn.last_lsn = clr;
                }
            }
        }

        self.wal
            .append(txn_id, txn.last_lsn, WalPayload::Abort)?;
        log::debug!("txn {} aborted", txn_id);
        Ok(())
    }

    /// Oldest snapshot xmin any active transaction still needs; versions
    /// whose deleter committed below this can never become visible.
    pub fn horizon(&self) -> TxnId {
        let state = self.state.lock();
        state
            .active
            .values()
            .map(|t| t.snapshot.xmin)
            .min()
            .unwrap_or(state.next_txn_id)
    }

    /// Drop conflict-tracking state no transaction can still observe.
    /// `seen` holds every transaction id stamped on a surviving heap
    /// version; vacuum collects it while scanning. An aborted id is only
    /// forgotten once it is below the horizon and none of its stamps
    /// survive, because unknown ids read as committed.
    pub fn prune_conflict_tables(&self, seen: &HashSet<TxnId>) {
        let floor = {
            let state = self.state.lock();
            state
                .active
                .values()
                .map(|t| t.start_seq)
                .min()
                .unwrap_or_else(|| self.commit_seq.load(Ordering::SeqCst))
        };
        // Entries at or below every active baseline can never conflict
        self.row_committers.retain(|_, seq| *seq > floor);

        let horizon = self.horizon();
        self.aborted.retain(|id| *id >= horizon || seen.contains(id));
    }

    #[cfg(test)]
    pub(crate) fn tracks_row_committer(&self, table: FileId, key: &[u8]) -> bool {
        self.row_committers.contains_key(&(table.0, key.to_vec()))
    }

    /// (id, last LSN) of every active transaction, for checkpoints.
    pub fn active_for_checkpoint(&self) -> Vec<(TxnId, Lsn)> {
        let state = self.state.lock();
        state
            .active
            .values()
            .map(|t| (t.id, t.last_lsn))
            .collect()
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active_ids.contains(&txn_id)
    }

    pub fn has_active(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    fn check_unique_secondaries(
        &self,
        txn_id: TxnId,
        snapshot: &Snapshot,
        heap: &VersionedHeap,
        secondaries: &[SecondaryIndex],
        value: &[u8],
    ) -> StorageResult<()> {
        for secondary in secondaries.iter().filter(|s| s.unique) {
            for row in secondary.index.lookup(value)? {
                if let Some(tuple) = heap.read(row)? {
                    if matches!(
                        self.version_visible(txn_id, snapshot, &tuple.header),
                        VersionView::Visible
                    ) {
                        return Err(StorageError::ConstraintViolation(format!(
                            "duplicate value in unique index {}",
                            secondary.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Stamp this transaction's xmax on a version, logging the patch.
    /// A version already stamped by anyone else is a write-write
    /// conflict: either the stamper is still active, or it committed
    /// after our snapshot (otherwise the version would have read as
    /// deleted).
    fn stamp_xmax(
        &self,
        txn_id: TxnId,
        table: FileId,
        key: &[u8],
        heap: &VersionedHeap,
        row: RowId,
        tuple: &Tuple,
    ) -> StorageResult<()> {
        if tuple.header.xmax != 0 {
            return Err(StorageError::SerializationConflict);
        }

        let before = heap.raw_bytes(row)?;
        let mut after = before.clone();
        after[8..16].copy_from_slice(&txn_id.to_le_bytes());

        let lsn = {
            let mut state = self.state.lock();
            let txn = state
                .active
                .get_mut(&txn_id)
                .ok_or(StorageError::TxnNotActive(txn_id))?;
            let lsn = self.wal.append(
                txn_id,
                txn.last_lsn,
                WalPayload::Delete {
                    location: row,
                    before: before.clone(),
                },
            )?;
            txn.last_lsn = lsn;
            txn.writes.push(WriteRecord {
                table,
                key: key.to_vec(),
                kind: WriteKind::Stamp { row, before },
                lsn,
            });
            lsn
        };

        heap.set_xmax(row, txn_id, lsn)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_insert(
        &self,
        txn_id: TxnId,
        table: FileId,
        key: &[u8],
        value: &[u8],
        heap: &VersionedHeap,
        primary: &BTreeIndex,
        secondaries: &[SecondaryIndex],
        tuple: Tuple,
    ) -> StorageResult<()> {
        let image = tuple.encode();
        let row = heap.insert_with(&tuple, |row| {
            let mut state = self.state.lock();
            let txn = state
                .active
                .get_mut(&txn_id)
                .ok_or(StorageError::TxnNotActive(txn_id))?;
            let lsn = self.wal.append(
                txn_id,
                txn.last_lsn,
                WalPayload::Insert {
                    location: row,
                    after: image.clone(),
                },
            )?;
            txn.last_lsn = lsn;
            txn.writes.push(WriteRecord {
                table,
                key: key.to_vec(),
                kind: WriteKind::Insert {
                    row,
                    value: value.to_vec(),
                },
                lsn,
            });
            Ok(lsn)
        })?;

        primary.insert(key, row)?;
        for secondary in secondaries {
            secondary.index.insert(value, row)?;
        }
        Ok(())
    }
}

/// Lazy cursor over a table's visible rows in key order.
///
/// Holds no page guards or latches between steps. Each step re-opens an
/// index scan just past the last yielded key, so index splits and merges
/// mid-scan cannot strand it, and rows resolve against the snapshot
/// captured when the cursor was opened.
pub struct ScanCursor<'a> {
    manager: &'a TransactionManager,
    heap: Arc<VersionedHeap>,
    primary: Arc<BTreeIndex>,
    txn_id: TxnId,
    snapshot: Snapshot,
    /// Last key yielded or skipped; scanning resumes after it.
    after: Option<Vec<u8>>,
    done: bool,
}

impl ScanCursor<'_> {
    fn step(&mut self) -> StorageResult<Option<(Vec<u8>, Vec<u8>)>> {
        'groups: loop {
            if self.done {
                return Ok(None);
            }
            // Gather the versions of the next key past `after`
            let mut group_key: Option<Vec<u8>> = None;
            let mut rows: Vec<RowId> = Vec::new();
            for item in self.primary.range_scan(self.after.as_deref(), None)? {
                let (key, row) = item?;
                if self.after.as_deref() == Some(key.as_slice()) {
                    continue;
                }
                match &group_key {
                    None => {
                        group_key = Some(key);
                        rows.push(row);
                    }
                    Some(k) if *k == key => rows.push(row),
                    Some(_) => break,
                }
            }
            let key = match group_key {
                Some(key) => key,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            self.after = Some(key.clone());

            // Versions arrive oldest first; resolve them newest first
            for row in rows.iter().rev() {
                let tuple = match self.heap.read(*row)? {
                    Some(t) => t,
                    None => continue,
                };
                match self
                    .manager
                    .version_visible(self.txn_id, &self.snapshot, &tuple.header)
                {
                    VersionView::Invisible => continue,
                    VersionView::Deleted => continue 'groups,
                    VersionView::Visible => {
                        let (_, value) = decode_row(&tuple.payload)?;
                        return Ok(Some((key, value)));
                    }
                }
            }
        }
    }
}

impl Iterator for ScanCursor<'_> {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// How a version reads under a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionView {
    /// Creator not visible; skip to an older version.
    Invisible,
    /// Creator visible, but so is a deleter; the row is gone.
    Deleted,
    Visible,
}
