//! WAL record types.
//!
//! Every record carries a strictly increasing LSN and the previous LSN
//! written by the same transaction, forming the per-transaction undo
//! chain. Physical records name a (file, page, slot) address and carry
//! raw before/after images of the tuple bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::page::{FileId, PageId};

/// Log Sequence Number. Zero is invalid and marks the end of an undo
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn next(&self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable address of a tuple or index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowLocation {
    pub file: FileId,
    pub page: PageId,
    pub slot: u16,
}

impl RowLocation {
    pub fn new(file: FileId, page: PageId, slot: u16) -> Self {
        Self { file, page, slot }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecordHeader {
    pub lsn: Lsn,
    /// Previous LSN written by the same transaction (invalid if first).
    pub prev_lsn: Lsn,
    pub txn_id: u64,
}

/// The page change performed by an undo step. Compensation records are
/// redo-only: they are replayed forward but never themselves undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompensationAction {
    /// Undo of an insert: the slot is zeroed.
    RemoveTuple { location: RowLocation },
    /// Undo of an update or delete: the before image is put back.
    RestoreTuple { location: RowLocation, image: Vec<u8> },
}

impl CompensationAction {
    pub fn location(&self) -> RowLocation {
        match self {
            CompensationAction::RemoveTuple { location } => *location,
            CompensationAction::RestoreTuple { location, .. } => *location,
        }
    }
}

/// Checkpoint payload: the transaction table and dirty page table at
/// checkpoint time, bounding the recovery scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// (txn id, last LSN) for every transaction active at the checkpoint.
    pub active_txns: Vec<(u64, Lsn)>,
    /// (file, page, recovery LSN) for every dirty buffered page.
    pub dirty_pages: Vec<(FileId, PageId, Lsn)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    Begin,
    Insert {
        location: RowLocation,
        after: Vec<u8>,
    },
    Update {
        location: RowLocation,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    Delete {
        location: RowLocation,
        before: Vec<u8>,
    },
    /// Serialized catalog snapshot written by a transaction that changed
    /// schema, before its commit record. Recovery installs the newest
    /// committed image so the catalog file can never lag the WAL.
    CatalogImage { image: Vec<u8> },
    Commit,
    Abort,
    Checkpoint(CheckpointPayload),
    Compensation {
        /// Next record to undo for this transaction; skips already-undone
        /// work if undo is itself interrupted by a crash.
        undo_next_lsn: Lsn,
        action: CompensationAction,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: WalPayload,
}

impl WalRecord {
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    pub fn txn_id(&self) -> u64 {
        self.header.txn_id
    }

    /// The page this record changes, if it is a physical record.
    pub fn location(&self) -> Option<RowLocation> {
        match &self.payload {
            WalPayload::Insert { location, .. }
            | WalPayload::Update { location, .. }
            | WalPayload::Delete { location, .. } => Some(*location),
            WalPayload::Compensation { action, .. } => Some(action.location()),
            _ => None,
        }
    }

    /// Build the compensation action that reverses this record, or None
    /// for records that carry no page change.
    pub fn undo_action(&self) -> Option<CompensationAction> {
        match &self.payload {
            WalPayload::Insert { location, .. } => Some(CompensationAction::RemoveTuple {
                location: *location,
            }),
            WalPayload::Update { location, before, .. } => Some(CompensationAction::RestoreTuple {
                location: *location,
                image: before.clone(),
            }),
            WalPayload::Delete { location, before } => Some(CompensationAction::RestoreTuple {
                location: *location,
                image: before.clone(),
            }),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> RowLocation {
        RowLocation::new(FileId(1), PageId(7), 3)
    }

    #[test]
    fn test_record_round_trip() {
        let records = vec![
            WalRecord {
                header: WalRecordHeader {
                    lsn: Lsn(1),
                    prev_lsn: Lsn::INVALID,
                    txn_id: 5,
                },
                payload: WalPayload::Begin,
            },
            WalRecord {
                header: WalRecordHeader {
                    lsn: Lsn(2),
                    prev_lsn: Lsn(1),
                    txn_id: 5,
                },
                payload: WalPayload::Insert {
                    location: loc(),
                    after: vec![1, 2, 3],
                },
            },
            WalRecord {
                header: WalRecordHeader {
                    lsn: Lsn(3),
                    prev_lsn: Lsn(2),
                    txn_id: 5,
                },
                payload: WalPayload::Update {
                    location: loc(),
                    before: vec![1, 2, 3],
                    after: vec![4, 5, 6],
                },
            },
            WalRecord {
                header: WalRecordHeader {
                    lsn: Lsn(4),
                    prev_lsn: Lsn(3),
                    txn_id: 5,
                },
                payload: WalPayload::Commit,
            },
        ];

        for record in records {
            let bytes = record.serialize().unwrap();
            let decoded = WalRecord::deserialize(&bytes).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn test_undo_action_inverts() {
        let insert = WalRecord {
            header: WalRecordHeader {
                lsn: Lsn(2),
                prev_lsn: Lsn(1),
                txn_id: 1,
            },
            payload: WalPayload::Insert {
                location: loc(),
                after: vec![9],
            },
        };
        assert!(matches!(
            insert.undo_action(),
            Some(CompensationAction::RemoveTuple { .. })
        ));

        let delete = WalRecord {
            header: WalRecordHeader {
                lsn: Lsn(3),
                prev_lsn: Lsn(2),
                txn_id: 1,
            },
            payload: WalPayload::Delete {
                location: loc(),
                before: vec![9],
            },
        };
        match delete.undo_action() {
            Some(CompensationAction::RestoreTuple { image, .. }) => assert_eq!(image, vec![9]),
            other => panic!("unexpected undo action: {:?}", other),
        }

        let commit = WalRecord {
            header: WalRecordHeader {
                lsn: Lsn(4),
                prev_lsn: Lsn(3),
                txn_id: 1,
            },
            payload: WalPayload::Commit,
        };
        assert!(commit.undo_action().is_none());
    }

    #[test]
    fn test_compensation_is_not_undoable() {
        let clr = WalRecord {
            header: WalRecordHeader {
                lsn: Lsn(9),
                prev_lsn: Lsn(8),
                txn_id: 2,
            },
            payload: WalPayload::Compensation {
                undo_next_lsn: Lsn(4),
                action: CompensationAction::RemoveTuple { location: loc() },
            },
        };
        assert!(clr.undo_action().is_none());
        assert_eq!(clr.location(), Some(loc()));
    }
}
