//! Versioned heap file.
//!
//! A heap holds row versions in slotted pages of one page-store file.
//! The heap is deliberately MVCC-agnostic: it stores and patches version
//! headers but never interprets visibility. Callers pass the LSN of the
//! log record describing each mutation; the heap stamps it on the page
//! so the buffer pool can enforce the write-ahead rule.

use crate::access::tuple::{RowId, Tuple, TxnId};
use crate::storage::buffer::{BufferPoolManager, GlobalPageId};
use crate::storage::page::slotted::SlottedPage;
use crate::storage::page::{self, FileId, PageId, PageType};
use crate::storage::wal::Lsn;
use crate::storage::{StorageError, StorageResult};
use parking_lot::Mutex;

pub struct VersionedHeap {
    file_id: FileId,
    buffer_pool: BufferPoolManager,
    /// Last page an insert landed on; tried first before allocating.
    insert_hint: Mutex<Option<PageId>>,
}

impl VersionedHeap {
    pub fn new(buffer_pool: BufferPoolManager, file_id: FileId) -> Self {
        Self {
            file_id,
            buffer_pool,
            insert_hint: Mutex::new(None),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    fn gpid(&self, page_id: PageId) -> GlobalPageId {
        GlobalPageId::new(self.file_id, page_id)
    }

    /// Stamp a page LSN. Unlogged mutations (vacuum) pass the invalid
    /// LSN and leave the page's recovery state alone.
    fn stamp(guard: &mut crate::storage::buffer::PageWriteGuard, lsn: Lsn) {
        if !lsn.is_invalid() {
            guard.set_lsn(lsn);
        }
    }

    /// Store a new version, returning its durable address.
    pub fn insert(&self, tuple: &Tuple, lsn: Lsn) -> StorageResult<RowId> {
        self.insert_with(tuple, |_| Ok(lsn))
    }

    /// Store a new version, obtaining the LSN from a callback that runs
    /// once the address is known but while the page is still pinned. Lets
    /// the caller append the log record naming the address before the
    /// page can reach disk.
    pub fn insert_with<F>(&self, tuple: &Tuple, log: F) -> StorageResult<RowId>
    where
        F: FnOnce(RowId) -> StorageResult<Lsn>,
    {
        let bytes = tuple.encode();

        let hint = *self.insert_hint.lock();
        if let Some(page_id) = hint {
            let mut guard = self.buffer_pool.fetch_page_write(self.gpid(page_id))?;
            let mut slotted = SlottedPage::new(&mut guard);
            if slotted.can_fit(bytes.len()) {
                let slot = slotted.insert(&bytes)?;
                let row = RowId::new(self.file_id, page_id, slot);
                let lsn = log(row)?;
                Self::stamp(&mut guard, lsn);
                return Ok(row);
            }
        }

        let (gpid, mut guard) = self.buffer_pool.new_page(self.file_id)?;
        page::init_page(&mut guard, PageType::Heap);
        let mut slotted = SlottedPage::new(&mut guard);
        let slot = slotted.insert(&bytes)?;
        let row = RowId::new(self.file_id, gpid.page, slot);
        let lsn = log(row)?;
        Self::stamp(&mut guard, lsn);
        *self.insert_hint.lock() = Some(gpid.page);
        Ok(row)
    }

    /// Read the version at `row`, or None if the slot has been reclaimed.
    pub fn read(&self, row: RowId) -> StorageResult<Option<Tuple>> {
        let guard = self.buffer_pool.fetch_page(self.gpid(row.page))?;
        let mut data = *guard;
        drop(guard);
        let slotted = SlottedPage::new(&mut data);
        if !slotted.is_live(row.slot) {
            return Ok(None);
        }
        let bytes = slotted.get(row.slot)?;
        Ok(Some(Tuple::decode(bytes)?))
    }

    /// Raw stored bytes of a live version, for WAL before images.
    pub fn raw_bytes(&self, row: RowId) -> StorageResult<Vec<u8>> {
        let guard = self.buffer_pool.fetch_page(self.gpid(row.page))?;
        let mut data = *guard;
        drop(guard);
        let slotted = SlottedPage::new(&mut data);
        Ok(slotted.get(row.slot)?.to_vec())
    }

    /// Replace a version's bytes with a logged image.
    pub fn overwrite(&self, row: RowId, bytes: &[u8], lsn: Lsn) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(self.gpid(row.page))?;
        let mut slotted = SlottedPage::new(&mut guard);
        slotted.update(row.slot, bytes)?;
        Self::stamp(&mut guard, lsn);
        Ok(())
    }

    /// Place version bytes at an exact address. Redo path: the page is
    /// grown and initialized if it never reached disk, and the image goes
    /// into the slot the log record names whether or not it is occupied.
    pub fn restore_at(&self, row: RowId, bytes: &[u8], lsn: Lsn) -> StorageResult<()> {
        let gpid = self.gpid(row.page);
        self.buffer_pool.ensure_page(gpid)?;
        let mut guard = self.buffer_pool.fetch_page_write(gpid)?;
        if page::page_type(&guard) != Some(PageType::Heap) {
            page::init_page(&mut guard, PageType::Heap);
        }
        let mut slotted = SlottedPage::new(&mut guard);
        if slotted.is_live(row.slot) {
            slotted.update(row.slot, bytes)?;
        } else {
            slotted.insert_at(row.slot, bytes)?;
        }
        Self::stamp(&mut guard, lsn);
        Ok(())
    }

    /// Stamp the deleting transaction on a version.
    pub fn set_xmax(&self, row: RowId, xmax: TxnId, lsn: Lsn) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(self.gpid(row.page))?;
        let mut slotted = SlottedPage::new(&mut guard);
        let mut bytes = slotted.get(row.slot)?.to_vec();
        if bytes.len() < 16 {
            return Err(StorageError::Corruption(
                "tuple shorter than version header".into(),
            ));
        }
        bytes[8..16].copy_from_slice(&xmax.to_le_bytes());
        slotted.update(row.slot, &bytes)?;
        Self::stamp(&mut guard, lsn);
        Ok(())
    }

    /// Zero a slot. Undo of an insert, and vacuum's reclamation step.
    pub fn remove(&self, row: RowId, lsn: Lsn) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(self.gpid(row.page))?;
        let mut slotted = SlottedPage::new(&mut guard);
        slotted.delete(row.slot)?;
        Self::stamp(&mut guard, lsn);
        Ok(())
    }

    /// Iterate every live version in the file, in (page, slot) order.
    pub fn scan(&self) -> StorageResult<HeapScan> {
        let num_pages = self.buffer_pool.file_pages(self.file_id)?;
        Ok(HeapScan {
            heap_file: self.file_id,
            buffer_pool: self.buffer_pool.clone(),
            num_pages,
            page: PageId(1),
            slot: 0,
        })
    }
}

pub struct HeapScan {
    heap_file: FileId,
    buffer_pool: BufferPoolManager,
    num_pages: u32,
    page: PageId,
    slot: u16,
}

impl Iterator for HeapScan {
    type Item = StorageResult<(RowId, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.0 >= self.num_pages {
                return None;
            }
            let gpid = GlobalPageId::new(self.heap_file, self.page);
            let guard = match self.buffer_pool.fetch_page(gpid) {
                Ok(g) => g,
                Err(e) => return Some(Err(e)),
            };
            let mut data = *guard;
            drop(guard);

            if page::page_type(&data) != Some(PageType::Heap) {
                self.page = PageId(self.page.0 + 1);
                self.slot = 0;
                continue;
            }

            let slotted = SlottedPage::new(&mut data);
            while self.slot < slotted.slot_count() {
                let slot = self.slot;
                self.slot += 1;
                if !slotted.is_live(slot) {
                    continue;
                }
                let bytes = match slotted.get(slot) {
                    Ok(b) => b,
                    Err(e) => return Some(Err(e)),
                };
                let tuple = match Tuple::decode(bytes) {
                    Ok(t) => t,
                    Err(e) => return Some(Err(e)),
                };
                return Some(Ok((RowId::new(self.heap_file, self.page, slot), tuple)));
            }

            self.page = PageId(self.page.0 + 1);
            self.slot = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tuple::VersionHeader;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::disk::PageStore;
    use tempfile::{tempdir, TempDir};

    const FILE: FileId = FileId(1);

    fn test_heap() -> (VersionedHeap, TempDir) {
        let dir = tempdir().unwrap();
        let store = PageStore::create(&dir.path().join("heap.db")).unwrap();
        let pool = BufferPoolManager::new(Box::new(LruReplacer::new(16)), 16);
        pool.register_file(FILE, store);
        (VersionedHeap::new(pool, FILE), dir)
    }

    fn tuple(xmin: TxnId, payload: &[u8]) -> Tuple {
        Tuple::new(VersionHeader::new(xmin), payload.to_vec())
    }

    #[test]
    fn test_insert_and_read() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let row = heap.insert(&tuple(1, b"first"), Lsn(1))?;
        let got = heap.read(row)?.unwrap();
        assert_eq!(got.payload, b"first");
        assert_eq!(got.header.xmin, 1);
        Ok(())
    }

    #[test]
    fn test_set_xmax_marks_deleted() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let row = heap.insert(&tuple(1, b"doomed"), Lsn(1))?;
        heap.set_xmax(row, 2, Lsn(2))?;
        let got = heap.read(row)?.unwrap();
        assert_eq!(got.header.xmax, 2);
        assert!(got.header.is_deleted());
        Ok(())
    }

    #[test]
    fn test_remove_frees_slot() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let row = heap.insert(&tuple(1, b"gone"), Lsn(1))?;
        heap.remove(row, Lsn(2))?;
        assert!(heap.read(row)?.is_none());
        Ok(())
    }

    #[test]
    fn test_scan_returns_live_versions_in_order() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let r0 = heap.insert(&tuple(1, b"a"), Lsn(1))?;
        let r1 = heap.insert(&tuple(1, b"b"), Lsn(2))?;
        let r2 = heap.insert(&tuple(1, b"c"), Lsn(3))?;
        heap.remove(r1, Lsn(4))?;

        let rows: Vec<_> = heap
            .scan()?
            .collect::<StorageResult<Vec<_>>>()?
            .into_iter()
            .map(|(row, t)| (row, t.payload))
            .collect();
        assert_eq!(rows, vec![(r0, b"a".to_vec()), (r2, b"c".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_insert_spills_to_new_page() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let big = vec![0x55u8; 1000];
        let mut rows = Vec::new();
        for _ in 0..10 {
            rows.push(heap.insert(&tuple(1, &big), Lsn(1))?);
        }
        let pages: std::collections::HashSet<_> = rows.iter().map(|r| r.page).collect();
        assert!(pages.len() > 1);
        for row in rows {
            assert_eq!(heap.read(row)?.unwrap().payload, big);
        }
        Ok(())
    }

    #[test]
    fn test_restore_at_recreates_missing_page() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let image = tuple(3, b"redone").encode();
        let row = RowId::new(FILE, PageId(5), 2);
        heap.restore_at(row, &image, Lsn(9))?;

        let got = heap.read(row)?.unwrap();
        assert_eq!(got.payload, b"redone");
        assert_eq!(got.header.xmin, 3);
        Ok(())
    }

    #[test]
    fn test_overwrite_restores_image() -> StorageResult<()> {
        let (heap, _dir) = test_heap();

        let row = heap.insert(&tuple(1, b"before"), Lsn(1))?;
        let before_image = heap.raw_bytes(row)?;
        heap.set_xmax(row, 7, Lsn(2))?;
        heap.overwrite(row, &before_image, Lsn(3))?;
        assert!(!heap.read(row)?.unwrap().header.is_deleted());
        Ok(())
    }
}
