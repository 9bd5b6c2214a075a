//! Fixed-size page file with a persisted free list.
//!
//! Page 0 of every file is reserved for the free list: a stack of freed
//! page numbers that `allocate` pops before growing the file. All I/O is
//! synchronous; caching is the buffer pool's job.

use crate::storage::page::{self, PageId, PageType};
use crate::storage::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

const FREE_COUNT_OFFSET: usize = page::PAGE_HEADER_SIZE;
const FREE_ENTRIES_OFFSET: usize = FREE_COUNT_OFFSET + 2;
const FREE_LIST_CAPACITY: usize = (PAGE_SIZE - FREE_ENTRIES_OFFSET) / 4;

pub struct PageStore {
    file: File,
    free_list: Vec<PageId>,
}

impl PageStore {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut store = Self {
            file,
            free_list: Vec::new(),
        };
        // Reserve page 0 for the free list
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        page::init_page(&mut buf, PageType::FreeList);
        store.write_raw(PageId(0), &mut buf)?;
        Ok(store)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut store = Self {
            file,
            free_list: Vec::new(),
        };
        store.load_free_list()?;
        Ok(store)
    }

    /// Read one page, verifying its checksum.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf.as_mut())?;

        if !page::verify_checksum(buf) {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch on page {}",
                page_id.0
            )));
        }
        Ok(())
    }

    /// Write one page, stamping its checksum first.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut buf = Box::new(*data);
        self.write_raw(page_id, &mut buf)
    }

    fn write_raw(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        page::update_checksum(buf);

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            self.file
                .set_len(offset + PAGE_SIZE as u64)
                .map_err(|_| StorageError::OutOfSpace)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf.as_ref())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Hand out a page number: reuse a freed page if one is available,
    /// otherwise grow the file by one page.
    pub fn allocate(&mut self) -> StorageResult<PageId> {
        if let Some(page_id) = self.free_list.pop() {
            self.persist_free_list()?;
            // Hand back a clean page
            let zero = Box::new([0u8; PAGE_SIZE]);
            self.write_page(page_id, &zero)?;
            return Ok(page_id);
        }

        let current = self.num_pages()?;
        // Page 0 is the free list; first data page is 1
        let new_page_id = PageId(current.max(1));
        let new_size = (new_page_id.0 as u64 + 1) * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .map_err(|_| StorageError::OutOfSpace)?;
        Ok(new_page_id)
    }

    /// Return a page to the free list. The list has bounded capacity; a
    /// page freed while the list is full stays unreachable until the file
    /// is rebuilt.
    pub fn free(&mut self, page_id: PageId) -> StorageResult<()> {
        if page_id.0 == 0 {
            return Err(StorageError::Corruption(
                "attempt to free reserved page 0".into(),
            ));
        }
        if self.free_list.len() >= FREE_LIST_CAPACITY {
            log::debug!("free list full; leaking page {}", page_id.0);
            return Ok(());
        }
        let zero = Box::new([0u8; PAGE_SIZE]);
        self.write_page(page_id, &zero)?;
        self.free_list.push(page_id);
        self.persist_free_list()
    }

    /// Grow the file so `page_id` is addressable. Recovery uses this to
    /// redo changes to pages that never reached disk before the crash.
    pub fn ensure_allocated(&mut self, page_id: PageId) -> StorageResult<()> {
        let needed = (page_id.0 as u64 + 1) * PAGE_SIZE as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed).map_err(|_| StorageError::OutOfSpace)?;
        }
        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn load_free_list(&mut self) -> StorageResult<()> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.read_page(PageId(0), &mut buf)?;
        if page::page_type(&buf) != Some(PageType::FreeList) {
            return Err(StorageError::Corruption(
                "page 0 is not a free-list page".into(),
            ));
        }
        let count =
            u16::from_le_bytes([buf[FREE_COUNT_OFFSET], buf[FREE_COUNT_OFFSET + 1]]) as usize;
        if count > FREE_LIST_CAPACITY {
            return Err(StorageError::Corruption("free-list count out of range".into()));
        }
        self.free_list.clear();
        for i in 0..count {
            let off = FREE_ENTRIES_OFFSET + i * 4;
            let id = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            self.free_list.push(PageId(id));
        }
        Ok(())
    }

    fn persist_free_list(&mut self) -> StorageResult<()> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        page::init_page(&mut buf, PageType::FreeList);
        buf[FREE_COUNT_OFFSET..FREE_COUNT_OFFSET + 2]
            .copy_from_slice(&(self.free_list.len() as u16).to_le_bytes());
        for (i, page_id) in self.free_list.iter().enumerate() {
            let off = FREE_ENTRIES_OFFSET + i * 4;
            buf[off..off + 4].copy_from_slice(&page_id.0.to_le_bytes());
        }
        self.write_raw(PageId(0), &mut buf)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = PageStore::create(&path)?;
            assert_eq!(store.num_pages()?, 1); // free-list page
        }
        {
            let store = PageStore::open(&path)?;
            assert_eq!(store.num_pages()?, 1);
        }
        Ok(())
    }

    #[test]
    fn test_allocate_write_read() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut store = PageStore::create(&dir.path().join("test.db"))?;

        let p1 = store.allocate()?;
        assert_eq!(p1, PageId(1));

        let mut data = Box::new([0u8; PAGE_SIZE]);
        page::init_page(&mut data, PageType::Heap);
        data[100] = 42;
        store.write_page(p1, &data)?;

        let mut read_buf = Box::new([0u8; PAGE_SIZE]);
        store.read_page(p1, &mut read_buf)?;
        assert_eq!(read_buf[100], 42);
        Ok(())
    }

    #[test]
    fn test_free_and_reuse() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut store = PageStore::create(&dir.path().join("test.db"))?;

        let p1 = store.allocate()?;
        let p2 = store.allocate()?;
        assert_ne!(p1, p2);

        store.free(p1)?;
        let p3 = store.allocate()?;
        assert_eq!(p3, p1); // freed page is reused
        Ok(())
    }

    #[test]
    fn test_free_list_survives_reopen() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut store = PageStore::create(&path)?;
            let p1 = store.allocate()?;
            let _p2 = store.allocate()?;
            store.free(p1)?;
        }
        {
            let mut store = PageStore::open(&path)?;
            let p = store.allocate()?;
            assert_eq!(p, PageId(1));
        }
        Ok(())
    }

    #[test]
    fn test_corruption_detected() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let p1 = {
            let mut store = PageStore::create(&path)?;
            let p1 = store.allocate()?;
            let mut data = Box::new([0u8; PAGE_SIZE]);
            page::init_page(&mut data, PageType::Heap);
            store.write_page(p1, &data)?;
            p1
        };

        // Flip a byte on disk behind the store's back
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(PAGE_SIZE as u64 + 200)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let mut store = PageStore::open(&path)?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        let result = store.read_page(p1, &mut buf);
        assert!(matches!(result, Err(StorageError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let mut store = PageStore::create(&dir.path().join("test.db"))?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        assert!(matches!(
            store.read_page(PageId(10), &mut buf),
            Err(StorageError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let p = {
            let mut store = PageStore::create(&path)?;
            let p = store.allocate()?;
            let mut data = Box::new([0u8; PAGE_SIZE]);
            page::init_page(&mut data, PageType::Heap);
            data[500] = 99;
            store.write_page(p, &data)?;
            p
        };

        let mut store = PageStore::open(&path)?;
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        store.read_page(p, &mut buf)?;
        assert_eq!(buf[500], 99);
        Ok(())
    }
}
