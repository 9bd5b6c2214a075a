pub mod slotted;

use crate::storage::PAGE_SIZE;

/// Identifier of a page within a single page-store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct PageId(pub u32);

/// Identifier of a page-store file (heap or index) registered with the
/// buffer pool. Assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct FileId(pub u32);

/// What a page's slotted body holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Heap = 1,
    BTreeLeaf = 2,
    BTreeInternal = 3,
    FreeList = 4,
    Meta = 5,
}

impl PageType {
    pub fn from_u8(v: u8) -> Option<PageType> {
        match v {
            0 => Some(PageType::Free),
            1 => Some(PageType::Heap),
            2 => Some(PageType::BTreeLeaf),
            3 => Some(PageType::BTreeInternal),
            4 => Some(PageType::FreeList),
            5 => Some(PageType::Meta),
            _ => None,
        }
    }
}

// Header layout. The checksum covers the full page with the checksum
// field zeroed; it is written on flush and verified on read.
pub const PAGE_HEADER_SIZE: usize = 24;
const TYPE_OFFSET: usize = 0;
const SLOT_COUNT_OFFSET: usize = 2;
const FREE_PTR_OFFSET: usize = 4;
const LSN_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 16;

/// Raw accessors over a page's fixed header. Free functions rather than a
/// wrapper type so both pinned guards and plain buffers can use them.
pub fn page_type(data: &[u8; PAGE_SIZE]) -> Option<PageType> {
    PageType::from_u8(data[TYPE_OFFSET])
}

pub fn set_page_type(data: &mut [u8; PAGE_SIZE], ty: PageType) {
    data[TYPE_OFFSET] = ty as u8;
}

pub fn slot_count(data: &[u8; PAGE_SIZE]) -> u16 {
    u16::from_le_bytes([data[SLOT_COUNT_OFFSET], data[SLOT_COUNT_OFFSET + 1]])
}

pub fn set_slot_count(data: &mut [u8; PAGE_SIZE], count: u16) {
    data[SLOT_COUNT_OFFSET..SLOT_COUNT_OFFSET + 2].copy_from_slice(&count.to_le_bytes());
}

pub fn free_space_pointer(data: &[u8; PAGE_SIZE]) -> u16 {
    u16::from_le_bytes([data[FREE_PTR_OFFSET], data[FREE_PTR_OFFSET + 1]])
}

pub fn set_free_space_pointer(data: &mut [u8; PAGE_SIZE], ptr: u16) {
    data[FREE_PTR_OFFSET..FREE_PTR_OFFSET + 2].copy_from_slice(&ptr.to_le_bytes());
}

/// LSN of the newest WAL record applied to this page. Redo compares
/// against it to stay idempotent; the buffer pool flushes the WAL up to
/// it before the page may reach disk.
pub fn page_lsn(data: &[u8; PAGE_SIZE]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[LSN_OFFSET..LSN_OFFSET + 8]);
    u64::from_le_bytes(buf)
}

pub fn set_page_lsn(data: &mut [u8; PAGE_SIZE], lsn: u64) {
    data[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
}

fn stored_checksum(data: &[u8; PAGE_SIZE]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
    u32::from_le_bytes(buf)
}

fn compute_checksum(data: &[u8; PAGE_SIZE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

pub fn update_checksum(data: &mut [u8; PAGE_SIZE]) {
    let sum = compute_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
}

/// An all-zero page (never written) passes; anything else must match.
pub fn verify_checksum(data: &[u8; PAGE_SIZE]) -> bool {
    if data.iter().all(|&b| b == 0) {
        return true;
    }
    stored_checksum(data) == compute_checksum(data)
}

/// Initialize a fresh page of the given type.
pub fn init_page(data: &mut [u8; PAGE_SIZE], ty: PageType) {
    data.fill(0);
    set_page_type(data, ty);
    set_free_space_pointer(data, PAGE_HEADER_SIZE as u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        init_page(&mut data, PageType::Heap);

        assert_eq!(page_type(&data), Some(PageType::Heap));
        assert_eq!(slot_count(&data), 0);
        assert_eq!(free_space_pointer(&data), PAGE_HEADER_SIZE as u16);
        assert_eq!(page_lsn(&data), 0);

        set_slot_count(&mut data, 7);
        set_page_lsn(&mut data, 42);
        assert_eq!(slot_count(&data), 7);
        assert_eq!(page_lsn(&data), 42);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        init_page(&mut data, PageType::Heap);
        set_page_lsn(&mut data, 99);
        update_checksum(&mut data);
        assert!(verify_checksum(&data));

        // Flip a byte in the body
        data[100] ^= 0xFF;
        assert!(!verify_checksum(&data));
    }

    #[test]
    fn test_zero_page_passes_checksum() {
        let data = Box::new([0u8; PAGE_SIZE]);
        assert!(verify_checksum(&data));
    }

    #[test]
    fn test_checksum_independent_of_stored_field() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        init_page(&mut data, PageType::BTreeLeaf);
        let before = compute_checksum(&data);
        update_checksum(&mut data);
        assert_eq!(before, compute_checksum(&data));
    }
}
