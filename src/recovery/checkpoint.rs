//! Recovery bookkeeping tables.
//!
//! The analysis pass rebuilds these from the last checkpoint record plus
//! the log tail. The transaction table tracks which transactions were in
//! flight at the crash and their newest LSN; the dirty page table tracks
//! the oldest LSN that may not have reached each page, which bounds the
//! redo scan.

use crate::access::tuple::TxnId;
use crate::storage::page::{FileId, PageId};
use crate::storage::wal::{CheckpointPayload, Lsn};
use std::collections::HashMap;

/// Transactions without a commit or abort record, keyed to their last
/// logged LSN. Whatever remains after analysis is a loser.
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: HashMap<TxnId, Lsn>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint(payload: &CheckpointPayload) -> Self {
        Self {
            entries: payload.active_txns.iter().copied().collect(),
        }
    }

    pub fn note_record(&mut self, txn_id: TxnId, lsn: Lsn) {
        self.entries.insert(txn_id, lsn);
    }

    pub fn note_end(&mut self, txn_id: TxnId) {
        self.entries.remove(&txn_id);
    }

    pub fn last_lsn(&self, txn_id: TxnId) -> Option<Lsn> {
        self.entries.get(&txn_id).copied()
    }

    pub fn losers(&self) -> impl Iterator<Item = (TxnId, Lsn)> + '_ {
        self.entries.iter().map(|(&t, &l)| (t, l))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pages that may hold changes newer than their on-disk image, keyed to
/// the first LSN that dirtied them (the recovery LSN).
#[derive(Debug, Default)]
pub struct DirtyPageTable {
    entries: HashMap<(FileId, PageId), Lsn>,
}

impl DirtyPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint(payload: &CheckpointPayload) -> Self {
        Self {
            entries: payload
                .dirty_pages
                .iter()
                .map(|&(f, p, lsn)| ((f, p), lsn))
                .collect(),
        }
    }

    /// Record a page write. Only the first write establishes the
    /// recovery LSN.
    pub fn note_write(&mut self, file: FileId, page: PageId, lsn: Lsn) {
        self.entries.entry((file, page)).or_insert(lsn);
    }

    /// The oldest recovery LSN, where redo must start.
    pub fn min_recovery_lsn(&self) -> Option<Lsn> {
        self.entries.values().copied().min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
