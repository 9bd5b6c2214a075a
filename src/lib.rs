//! granitedb: an embeddable page-based storage engine.
//!
//! A single data directory holds slotted heap files, B-tree index files,
//! a write-ahead log and a catalog. Transactions run under snapshot
//! isolation with multi-version rows; crash recovery replays the log in
//! the classic analysis / redo / undo shape. The [`engine::Engine`] type
//! is the external surface; everything below it is layered as
//! storage (pages, buffer pool, WAL), access (heaps, B-trees),
//! concurrency (MVCC, vacuum) and recovery.

pub mod access;
pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod recovery;
pub mod storage;

pub use catalog::{ColumnMeta, ColumnType};
pub use concurrency::mvcc::ScanCursor;
pub use config::EngineConfig;
pub use engine::Engine;
pub use storage::{StorageError, StorageResult};
