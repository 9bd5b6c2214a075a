//! Slotted page body shared by heap and B-tree pages.
//!
//! The slot directory grows from the page tail (4 bytes per slot: offset,
//! length), record data grows forward from the header. Slot numbers are
//! stable for the lifetime of the page, so a (page, slot) pair is a
//! durable address; deleted slots are zeroed and may be re-filled, but
//! never compacted away.

use crate::storage::page::{
    free_space_pointer, set_free_space_pointer, set_slot_count, slot_count, PAGE_HEADER_SIZE,
};
use crate::storage::{StorageError, StorageResult, PAGE_SIZE};

pub const SLOT_SIZE: usize = 4;

pub struct SlottedPage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> SlottedPage<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn slot_count(&self) -> u16 {
        slot_count(self.data)
    }

    fn slot_offset(slot: u16) -> usize {
        PAGE_SIZE - ((slot + 1) as usize * SLOT_SIZE)
    }

    fn read_slot(&self, slot: u16) -> (u16, u16) {
        let off = Self::slot_offset(slot);
        let offset = u16::from_le_bytes([self.data[off], self.data[off + 1]]);
        let length = u16::from_le_bytes([self.data[off + 2], self.data[off + 3]]);
        (offset, length)
    }

    fn write_slot(&mut self, slot: u16, offset: u16, length: u16) {
        let off = Self::slot_offset(slot);
        self.data[off..off + 2].copy_from_slice(&offset.to_le_bytes());
        self.data[off + 2..off + 4].copy_from_slice(&length.to_le_bytes());
    }

    pub fn free_space(&self) -> usize {
        let slot_array_start = PAGE_SIZE - (self.slot_count() as usize * SLOT_SIZE);
        slot_array_start.saturating_sub(free_space_pointer(self.data) as usize)
    }

    pub fn can_fit(&self, record_len: usize) -> bool {
        self.free_space() >= record_len + SLOT_SIZE
    }

    /// Append a record into a new slot, returning the slot number.
    pub fn insert(&mut self, record: &[u8]) -> StorageResult<u16> {
        if record.len() > u16::MAX as usize {
            return Err(StorageError::Serialization("record too large for page".into()));
        }
        if !self.can_fit(record.len()) {
            return Err(StorageError::Serialization(format!(
                "page full: need {} bytes, {} free",
                record.len() + SLOT_SIZE,
                self.free_space()
            )));
        }

        let offset = free_space_pointer(self.data);
        self.data[offset as usize..offset as usize + record.len()].copy_from_slice(record);
        set_free_space_pointer(self.data, offset + record.len() as u16);

        let slot = self.slot_count();
        self.write_slot(slot, offset, record.len() as u16);
        set_slot_count(self.data, slot + 1);
        Ok(slot)
    }

    /// Place a record at an exact slot. Used by redo, which must restore a
    /// tuple at the address its log record names. Extends the directory
    /// with empty slots if needed.
    pub fn insert_at(&mut self, slot: u16, record: &[u8]) -> StorageResult<()> {
        while self.slot_count() <= slot {
            let next = self.slot_count();
            self.write_slot(next, 0, 0);
            set_slot_count(self.data, next + 1);
        }
        let offset = free_space_pointer(self.data);
        let slot_array_start = PAGE_SIZE - (self.slot_count() as usize * SLOT_SIZE);
        if (offset as usize) + record.len() > slot_array_start {
            return Err(StorageError::Serialization("page full during redo".into()));
        }
        self.data[offset as usize..offset as usize + record.len()].copy_from_slice(record);
        set_free_space_pointer(self.data, offset + record.len() as u16);
        self.write_slot(slot, offset, record.len() as u16);
        Ok(())
    }

    pub fn get(&self, slot: u16) -> StorageResult<&[u8]> {
        if slot >= self.slot_count() {
            return Err(StorageError::Serialization(format!(
                "slot {} out of range ({} slots)",
                slot,
                self.slot_count()
            )));
        }
        let (offset, length) = self.read_slot(slot);
        if offset == 0 && length == 0 {
            return Err(StorageError::Serialization(format!("slot {} is empty", slot)));
        }
        Ok(&self.data[offset as usize..offset as usize + length as usize])
    }

    pub fn is_live(&self, slot: u16) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let (offset, length) = self.read_slot(slot);
        !(offset == 0 && length == 0)
    }

    /// Zero the slot entry. The record bytes stay behind until the page is
    /// rewritten; the slot number remains allocated.
    pub fn delete(&mut self, slot: u16) -> StorageResult<()> {
        if slot >= self.slot_count() {
            return Err(StorageError::Serialization(format!(
                "slot {} out of range ({} slots)",
                slot,
                self.slot_count()
            )));
        }
        self.write_slot(slot, 0, 0);
        Ok(())
    }

    /// Overwrite a record in place. Shrinking is always allowed; growing
    /// requires free space for a relocated copy.
    pub fn update(&mut self, slot: u16, record: &[u8]) -> StorageResult<()> {
        if slot >= self.slot_count() {
            return Err(StorageError::Serialization(format!(
                "slot {} out of range ({} slots)",
                slot,
                self.slot_count()
            )));
        }
        let (offset, length) = self.read_slot(slot);
        if offset == 0 && length == 0 {
            return Err(StorageError::Serialization(format!("slot {} is empty", slot)));
        }
        if record.len() <= length as usize {
            self.data[offset as usize..offset as usize + record.len()].copy_from_slice(record);
            self.write_slot(slot, offset, record.len() as u16);
            return Ok(());
        }
        // Relocate
        let slot_array_start = PAGE_SIZE - (self.slot_count() as usize * SLOT_SIZE);
        let new_offset = free_space_pointer(self.data);
        if new_offset as usize + record.len() > slot_array_start {
            return Err(StorageError::Serialization(format!(
                "page full: cannot grow slot {} to {} bytes",
                slot,
                record.len()
            )));
        }
        self.data[new_offset as usize..new_offset as usize + record.len()].copy_from_slice(record);
        set_free_space_pointer(self.data, new_offset + record.len() as u16);
        self.write_slot(slot, new_offset, record.len() as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{init_page, PageType};

    fn fresh_page() -> Box<[u8; PAGE_SIZE]> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        init_page(&mut data, PageType::Heap);
        data
    }

    #[test]
    fn test_insert_and_get() {
        let mut data = fresh_page();
        let mut page = SlottedPage::new(&mut data);

        let s0 = page.insert(b"alpha").unwrap();
        let s1 = page.insert(b"beta").unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
        assert_eq!(page.get(s0).unwrap(), b"alpha");
        assert_eq!(page.get(s1).unwrap(), b"beta");
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn test_delete_keeps_slot_numbers_stable() {
        let mut data = fresh_page();
        let mut page = SlottedPage::new(&mut data);

        let s0 = page.insert(b"one").unwrap();
        let s1 = page.insert(b"two").unwrap();
        page.delete(s0).unwrap();

        assert!(!page.is_live(s0));
        assert!(page.get(s0).is_err());
        assert_eq!(page.get(s1).unwrap(), b"two");
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn test_update_in_place_and_relocated() {
        let mut data = fresh_page();
        let mut page = SlottedPage::new(&mut data);

        let s = page.insert(b"longer record").unwrap();
        page.update(s, b"short").unwrap();
        assert_eq!(page.get(s).unwrap(), b"short");

        page.update(s, b"a record longer than the original").unwrap();
        assert_eq!(page.get(s).unwrap(), b"a record longer than the original");
    }

    #[test]
    fn test_page_full() {
        let mut data = fresh_page();
        let mut page = SlottedPage::new(&mut data);

        let big = vec![0xAB; 900];
        let mut inserted = 0;
        while page.can_fit(big.len()) {
            page.insert(&big).unwrap();
            inserted += 1;
        }
        assert!(inserted > 0);
        assert!(page.insert(&big).is_err());
    }

    #[test]
    fn test_insert_at_exact_slot() {
        let mut data = fresh_page();
        let mut page = SlottedPage::new(&mut data);

        page.insert_at(3, b"redo me").unwrap();
        assert_eq!(page.slot_count(), 4);
        assert_eq!(page.get(3).unwrap(), b"redo me");
        assert!(!page.is_live(0));
    }
}
