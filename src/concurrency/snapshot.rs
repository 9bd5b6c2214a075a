//! Transaction snapshots.
//!
//! A snapshot freezes the set of transactions whose effects a reader may
//! observe. Commit state is not part of the snapshot (it changes after
//! capture); the transaction manager combines `permits` with its commit
//! table to decide full visibility.

use crate::access::tuple::TxnId;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Oldest transaction active at capture time.
    pub xmin: TxnId,
    /// First transaction id not yet assigned at capture time.
    pub xmax: TxnId,
    /// Transactions active at capture time.
    pub active: HashSet<TxnId>,
}

impl Snapshot {
    /// Whether the snapshot permits seeing `txn_id`'s effects, assuming
    /// it committed. Transactions started after capture, and those still
    /// active at capture, are invisible.
    pub fn permits(&self, txn_id: TxnId) -> bool {
        txn_id != 0 && txn_id < self.xmax && !self.active.contains(&txn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(xmin: TxnId, xmax: TxnId, active: &[TxnId]) -> Snapshot {
        Snapshot {
            xmin,
            xmax,
            active: active.iter().copied().collect(),
        }
    }

    #[test]
    fn test_committed_before_capture_is_permitted() {
        let s = snapshot(3, 10, &[3, 7]);
        assert!(s.permits(2));
        assert!(s.permits(9));
    }

    #[test]
    fn test_active_at_capture_is_not_permitted() {
        let s = snapshot(3, 10, &[3, 7]);
        assert!(!s.permits(3));
        assert!(!s.permits(7));
    }

    #[test]
    fn test_started_after_capture_is_not_permitted() {
        let s = snapshot(3, 10, &[]);
        assert!(!s.permits(10));
        assert!(!s.permits(11));
    }

    #[test]
    fn test_zero_is_never_permitted() {
        let s = snapshot(1, 10, &[]);
        assert!(!s.permits(0));
    }
}
