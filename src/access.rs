//! Access layer: row versions, heap files, and the B-tree index.

pub mod btree;
pub mod heap;
pub mod tuple;

pub use btree::{BTreeCursor, BTreeIndex};
pub use heap::{HeapScan, VersionedHeap};
pub use tuple::{RowId, Tuple, TxnId, VersionHeader};
