//! Write-ahead-log crash recovery.

pub mod aries;
pub mod checkpoint;

pub use aries::{latest_committed_catalog_image, RecoveryManager, RecoveryReport};
pub use checkpoint::{DirtyPageTable, TransactionTable};
