pub mod lru;
pub mod replacer;

use crate::storage::page::{self, FileId, PageId};
use crate::storage::wal::{Lsn, WalManager};
use crate::storage::{PageStore, StorageError, StorageResult, PAGE_SIZE};
use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Address of a page across all registered page-store files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPageId {
    pub file: FileId,
    pub page: PageId,
}

impl GlobalPageId {
    pub fn new(file: FileId, page: PageId) -> Self {
        Self { file, page }
    }
}

/// Page bytes and identity. Only reachable through the slot's
/// reader-writer latch, which is what page guards hold.
struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page: Option<GlobalPageId>,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page: None,
        }
    }
}

/// One buffer slot: the latched frame plus bookkeeping that must stay
/// readable without taking the latch.
struct FrameSlot {
    frame: Arc<RwLock<Frame>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    /// LSN redo must start from for this page: set when the frame turns
    /// dirty, before any new record touches it.
    rec_lsn: AtomicU64,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            frame: Arc::new(RwLock::new(Frame::new())),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            rec_lsn: AtomicU64::new(0),
        }
    }

    /// Mark dirty, capturing the recovery LSN on the clean-to-dirty
    /// transition. The caller holds the frame's write latch, so the page
    /// LSN is stable; any record applied from here on has a larger LSN
    /// than the page carried while clean.
    fn mark_dirty(&self, data: &[u8; PAGE_SIZE]) {
        if !self.is_dirty.swap(true, Ordering::SeqCst) {
            self.rec_lsn
                .store(page::page_lsn(data) + 1, Ordering::SeqCst);
        }
    }

    fn clear(&self, frame: &mut Frame) {
        frame.page = None;
        frame.data.fill(0);
        self.is_dirty.store(false, Ordering::SeqCst);
        self.rec_lsn.store(0, Ordering::SeqCst);
    }
}

/// Shared in-memory page cache over any number of page-store files.
///
/// Each frame carries a reader-writer latch: any number of read guards
/// or exactly one write guard may exist per page. Guards also pin their
/// frame; eviction only touches frames with no pins and no latch
/// holders.
///
/// Enforces the write-ahead rule: before a dirty frame's bytes may reach
/// disk (eviction or explicit flush), the WAL is flushed up to the page's
/// stored LSN.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<GlobalPageId, FrameId>,
    frames: RwLock<HashMap<FrameId, Arc<FrameSlot>>>,
    replacer: Mutex<Box<dyn Replacer>>,
    files: DashMap<FileId, Mutex<PageStore>>,
    wal: RwLock<Option<Arc<WalManager>>>,
    /// Serializes misses and allocations so one page never occupies two
    /// frames at once.
    load_lock: Mutex<()>,
    next_frame_id: AtomicU32,
    max_frames: usize,
}

impl BufferPoolManager {
    pub fn new(replacer: Box<dyn Replacer>, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::new(),
                frames: RwLock::new(HashMap::with_capacity(max_frames)),
                replacer: Mutex::new(replacer),
                files: DashMap::new(),
                wal: RwLock::new(None),
                load_lock: Mutex::new(()),
                next_frame_id: AtomicU32::new(0),
                max_frames,
            }),
        }
    }

    /// Wire in the WAL. Done once at engine startup, after both exist.
    pub fn attach_wal(&self, wal: Arc<WalManager>) {
        *self.inner.wal.write() = Some(wal);
    }

    pub fn register_file(&self, file_id: FileId, store: PageStore) {
        self.inner.files.insert(file_id, Mutex::new(store));
    }

    /// Drop a file and every cached frame belonging to it. Cached state is
    /// discarded, not flushed; used when the file itself is being deleted.
    pub fn unregister_file(&self, file_id: FileId) {
        let stale: Vec<(GlobalPageId, FrameId)> = self
            .inner
            .page_table
            .iter()
            .filter(|e| e.key().file == file_id)
            .map(|e| (*e.key(), *e.value()))
            .collect();

        for (gpid, frame_id) in stale {
            self.inner.page_table.remove(&gpid);
            let slot = self.inner.frames.read().get(&frame_id).cloned();
            if let Some(slot) = slot {
                let mut frame = slot.frame.write();
                slot.clear(&mut frame);
                slot.pin_count.store(0, Ordering::SeqCst);
            }
            self.inner.replacer.lock().unpin(frame_id);
        }
        self.inner.files.remove(&file_id);
    }

    pub fn fetch_page(&self, gpid: GlobalPageId) -> StorageResult<PageReadGuard> {
        loop {
            let pin = self.pin_frame(gpid)?;
            let guard = pin.slot.frame.read_arc();
            if guard.page == Some(gpid) {
                return Ok(PageReadGuard { guard, pin });
            }
            // The frame was recycled between pinning and latching; retry
        }
    }

    pub fn fetch_page_write(&self, gpid: GlobalPageId) -> StorageResult<PageWriteGuard> {
        loop {
            let pin = self.pin_frame(gpid)?;
            let guard = pin.slot.frame.write_arc();
            if guard.page == Some(gpid) {
                pin.slot.mark_dirty(&guard.data);
                return Ok(PageWriteGuard { guard, pin });
            }
        }
    }

    /// Allocate a fresh page in the given file and pin it for writing.
    pub fn new_page(&self, file_id: FileId) -> StorageResult<(GlobalPageId, PageWriteGuard)> {
        if !self.inner.files.contains_key(&file_id) {
            return Err(StorageError::FileNotFound(file_id.0));
        }
        let _load = self.inner.load_lock.lock();
        let (frame_id, slot) = self.acquire_frame()?;

        let page_id = {
            let store = match self.inner.files.get(&file_id) {
                Some(store) => store,
                None => {
                    self.inner.replacer.lock().unpin(frame_id);
                    return Err(StorageError::FileNotFound(file_id.0));
                }
            };
            let mut store = store.lock();
            match store.allocate() {
                Ok(page_id) => page_id,
                Err(e) => {
                    self.inner.replacer.lock().unpin(frame_id);
                    return Err(e);
                }
            }
        };
        let gpid = GlobalPageId::new(file_id, page_id);

        slot.pin_count.store(1, Ordering::SeqCst);
        let pin = FramePin {
            inner: self.inner.clone(),
            frame_id,
            slot,
        };
        let mut guard = pin.slot.frame.write_arc();
        guard.page = Some(gpid);
        pin.slot.mark_dirty(&guard.data);
        self.inner.page_table.insert(gpid, frame_id);
        self.inner.replacer.lock().pin(frame_id);
        Ok((gpid, PageWriteGuard { guard, pin }))
    }

    /// Return an unpinned page to its file's free list.
    pub fn free_page(&self, gpid: GlobalPageId) -> StorageResult<()> {
        if let Some((_, frame_id)) = self.inner.page_table.remove(&gpid) {
            let slot = self.inner.frames.read().get(&frame_id).cloned();
            if let Some(slot) = slot {
                if slot.pin_count.load(Ordering::SeqCst) > 0 {
                    // Re-insert and refuse; the caller still holds a pin
                    self.inner.page_table.insert(gpid, frame_id);
                    return Err(StorageError::BufferPoolExhausted);
                }
                let mut frame = slot.frame.write();
                slot.clear(&mut frame);
            }
            self.inner.replacer.lock().unpin(frame_id);
        }

        let store = self
            .inner
            .files
            .get(&gpid.file)
            .ok_or(StorageError::FileNotFound(gpid.file.0))?;
        let mut store = store.lock();
        store.free(gpid.page)
    }

    /// Make `gpid` addressable in its file, growing the file if needed.
    pub fn ensure_page(&self, gpid: GlobalPageId) -> StorageResult<()> {
        let store = self
            .inner
            .files
            .get(&gpid.file)
            .ok_or(StorageError::FileNotFound(gpid.file.0))?;
        let mut store = store.lock();
        store.ensure_allocated(gpid.page)
    }

    /// Number of pages (including reserved page 0) in a registered file.
    pub fn file_pages(&self, file_id: FileId) -> StorageResult<u32> {
        let store = self
            .inner
            .files
            .get(&file_id)
            .ok_or(StorageError::FileNotFound(file_id.0))?;
        let store = store.lock();
        store.num_pages()
    }

    pub fn flush_page(&self, gpid: GlobalPageId) -> StorageResult<()> {
        if let Some(frame_id) = self.inner.page_table.get(&gpid).map(|e| *e.value()) {
            let slot = self.inner.frames.read().get(&frame_id).cloned();
            if let Some(slot) = slot {
                let frame = slot.frame.read();
                if frame.page == Some(gpid) && slot.is_dirty.load(Ordering::SeqCst) {
                    self.write_out(gpid, &frame.data)?;
                    slot.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        let slots: Vec<Arc<FrameSlot>> = self.inner.frames.read().values().cloned().collect();
        for slot in slots {
            let frame = slot.frame.read();
            if let Some(gpid) = frame.page {
                if slot.is_dirty.load(Ordering::SeqCst) {
                    self.write_out(gpid, &frame.data)?;
                    slot.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    /// Dirty pages currently cached, with their recovery LSNs, for
    /// checkpointing.
    pub fn dirty_pages(&self) -> Vec<(FileId, PageId, Lsn)> {
        let slots: Vec<Arc<FrameSlot>> = self.inner.frames.read().values().cloned().collect();
        let mut dirty = Vec::new();
        for slot in slots {
            if !slot.is_dirty.load(Ordering::SeqCst) {
                continue;
            }
            let frame = slot.frame.read();
            if let Some(gpid) = frame.page {
                dirty.push((gpid.file, gpid.page, Lsn(slot.rec_lsn.load(Ordering::SeqCst))));
            }
        }
        dirty
    }

    /// Write a frame's bytes to its file, honoring the write-ahead rule.
    fn write_out(&self, gpid: GlobalPageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let page_lsn = Lsn(page::page_lsn(data));
        if !page_lsn.is_invalid() {
            if let Some(wal) = self.inner.wal.read().as_ref() {
                wal.flush_up_to(page_lsn)?;
            }
        }
        let store = self
            .inner
            .files
            .get(&gpid.file)
            .ok_or(StorageError::FileNotFound(gpid.file.0))?;
        let mut store = store.lock();
        store.write_page(gpid.page, data)
    }

    /// Pin the frame holding `gpid`, loading the page from disk on a
    /// miss. The pin is taken before the frame latch, so the caller must
    /// verify the frame still holds the page once latched.
    fn pin_frame(&self, gpid: GlobalPageId) -> StorageResult<FramePin> {
        loop {
            if let Some(frame_id) = self.inner.page_table.get(&gpid).map(|e| *e.value()) {
                let slot = self.inner.frames.read().get(&frame_id).cloned();
                if let Some(slot) = slot {
                    slot.pin_count.fetch_add(1, Ordering::SeqCst);
                    self.inner.replacer.lock().pin(frame_id);
                    return Ok(FramePin {
                        inner: self.inner.clone(),
                        frame_id,
                        slot,
                    });
                }
            }

            let _load = self.inner.load_lock.lock();
            if self.inner.page_table.contains_key(&gpid) {
                // Loaded by another thread while we waited
                continue;
            }
            if !self.inner.files.contains_key(&gpid.file) {
                return Err(StorageError::FileNotFound(gpid.file.0));
            }
            let (frame_id, slot) = self.acquire_frame()?;
            {
                let store = self
                    .inner
                    .files
                    .get(&gpid.file)
                    .ok_or(StorageError::FileNotFound(gpid.file.0))?;
                let mut store = store.lock();
                let mut frame = slot.frame.write();
                if let Err(e) = store.read_page(gpid.page, frame.data.as_mut()) {
                    drop(frame);
                    // Return the frame to the eviction candidates
                    self.inner.replacer.lock().unpin(frame_id);
                    return Err(e);
                }
                frame.page = Some(gpid);
            }
            slot.pin_count.fetch_add(1, Ordering::SeqCst);
            self.inner.page_table.insert(gpid, frame_id);
            self.inner.replacer.lock().pin(frame_id);
            return Ok(FramePin {
                inner: self.inner.clone(),
                frame_id,
                slot,
            });
        }
    }

    /// Find a free frame: grow the pool up to its budget, otherwise evict
    /// the LRU unpinned frame. Never blocks waiting for a pin or a latch
    /// to be released.
    fn acquire_frame(&self) -> StorageResult<(FrameId, Arc<FrameSlot>)> {
        {
            let frames = self.inner.frames.read();
            if frames.len() < self.inner.max_frames {
                drop(frames);
                let mut frames = self.inner.frames.write();
                if frames.len() < self.inner.max_frames {
                    let frame_id = self.inner.next_frame_id.fetch_add(1, Ordering::SeqCst);
                    let slot = Arc::new(FrameSlot::new());
                    frames.insert(frame_id, slot.clone());
                    return Ok((frame_id, slot));
                }
            }
        }

        let victim = {
            let mut replacer = self.inner.replacer.lock();
            replacer.evict().ok_or(StorageError::BufferPoolExhausted)?
        };
        let slot = self
            .inner
            .frames
            .read()
            .get(&victim)
            .cloned()
            .ok_or(StorageError::BufferPoolExhausted)?;

        let mut frame = match slot.frame.try_write() {
            Some(guard) => guard,
            None => {
                // Someone re-latched it between eviction and here
                self.inner.replacer.lock().unpin(victim);
                return Err(StorageError::BufferPoolExhausted);
            }
        };
        if slot.pin_count.load(Ordering::SeqCst) > 0 {
            // Re-pinned while we raced; its holder re-registers the frame
            // when the last pin drops
            return Err(StorageError::BufferPoolExhausted);
        }
        if let Some(old) = frame.page {
            if slot.is_dirty.load(Ordering::SeqCst) {
                if let Err(e) = self.write_out(old, &frame.data) {
                    drop(frame);
                    self.inner.replacer.lock().unpin(victim);
                    return Err(e);
                }
            }
            self.inner.page_table.remove(&old);
        }
        slot.clear(&mut frame);
        drop(frame);
        Ok((victim, slot))
    }
}

/// Pin on a buffer slot. Released on drop, returning the frame to the
/// eviction candidates when the last pin goes.
struct FramePin {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    slot: Arc<FrameSlot>,
}

impl Drop for FramePin {
    fn drop(&mut self) {
        if self.slot.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.replacer.lock().unpin(self.frame_id);
        }
    }
}

/// Shared access to one page: any number may exist per frame.
pub struct PageReadGuard {
    // Declared before the pin so the latch is released first on drop
    guard: ArcRwLockReadGuard<RawRwLock, Frame>,
    pin: FramePin,
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

/// Exclusive access to one page: excludes all other guards on the frame.
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Frame>,
    pin: FramePin,
}

impl PageWriteGuard {
    /// Stamp the LSN of the newest WAL record applied to this page.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        page::set_page_lsn(&mut self.guard.data, lsn.0);
    }

    pub fn lsn(&self) -> Lsn {
        Lsn(page::page_lsn(&self.guard.data))
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data
    }
}
