//! Concurrency control: snapshots, the MVCC transaction manager, and
//! version reclamation.

pub mod mvcc;
pub mod snapshot;
pub mod vacuum;

pub use mvcc::{SecondaryIndex, TableRegistry, TableSet, TransactionManager};
pub use snapshot::Snapshot;
pub use vacuum::{Vacuum, VacuumWorker};
