//! Storage layer.
//!
//! Page-based persistence built from four pieces:
//!
//! - **page**: the 4KB page format with header, checksum, and slotted
//!   record layout
//! - **disk**: page-store files with a persisted free list
//! - **buffer**: the shared page cache with LRU eviction and pin counts
//! - **wal**: the append-only write-ahead log
//!
//! The buffer pool enforces the write-ahead rule; everything above this
//! layer reads and writes pages only through pin guards.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPoolManager, GlobalPageId, PageReadGuard, PageWriteGuard};
pub use disk::{PageStore, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{FileId, PageId, PageType};
