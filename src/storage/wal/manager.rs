//! WAL manager.
//!
//! A single append-only log file per engine. Records are framed as
//! length (u32) + CRC32 (u32) + bincode payload. LSNs are allocated under
//! the append lock, so LSN order is append order. `flush_up_to` is the
//! only durability boundary the rest of the engine relies on.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use super::record::{Lsn, WalPayload, WalRecord, WalRecordHeader};
use crate::storage::{StorageError, StorageResult};

const FRAME_HEADER_SIZE: usize = 8;

struct WalState {
    file: File,
    next_lsn: u64,
    /// Framed records appended but not yet written to the file.
    buffer: Vec<u8>,
    last_appended: Lsn,
}

pub struct WalManager {
    state: Mutex<WalState>,
    /// All records with LSN <= this value are durable.
    flushed_lsn: AtomicU64,
}

impl WalManager {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            state: Mutex::new(WalState {
                file,
                next_lsn: 1,
                buffer: Vec::new(),
                last_appended: Lsn::INVALID,
            }),
            flushed_lsn: AtomicU64::new(0),
        })
    }

    /// Open an existing log, scanning it to restore the LSN counter and
    /// truncating any torn tail frame left by a crash.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let (records, valid_end) = read_frames(&mut file)?;
        let max_lsn = records.last().map(|r| r.lsn()).unwrap_or(Lsn::INVALID);

        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            log::warn!(
                "truncating torn WAL tail: {} of {} bytes valid",
                valid_end,
                file_len
            );
            file.set_len(valid_end)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            state: Mutex::new(WalState {
                file,
                next_lsn: max_lsn.0 + 1,
                buffer: Vec::new(),
                last_appended: max_lsn,
            }),
            flushed_lsn: AtomicU64::new(max_lsn.0),
        })
    }

    /// Append a record, allocating its LSN. The record is buffered; it
    /// becomes durable only once `flush_up_to` covers its LSN.
    pub fn append(&self, txn_id: u64, prev_lsn: Lsn, payload: WalPayload) -> StorageResult<Lsn> {
        let mut state = self.state.lock();
        let lsn = Lsn(state.next_lsn);
        state.next_lsn += 1;

        let record = WalRecord {
            header: WalRecordHeader {
                lsn,
                prev_lsn,
                txn_id,
            },
            payload,
        };
        let body = record
            .serialize()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        state.buffer.extend_from_slice(&(body.len() as u32).to_le_bytes());
        state.buffer.extend_from_slice(&crc.to_le_bytes());
        state.buffer.extend_from_slice(&body);
        state.last_appended = lsn;

        Ok(lsn)
    }

    /// Force every record with LSN <= `lsn` to durable storage.
    pub fn flush_up_to(&self, lsn: Lsn) -> StorageResult<()> {
        if self.flushed_lsn.load(Ordering::Acquire) >= lsn.0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut state.buffer);
        state.file.write_all(&buffer)?;
        state.file.sync_all()?;
        let durable = state.last_appended;
        self.flushed_lsn.store(durable.0, Ordering::Release);
        Ok(())
    }

    /// Flush everything appended so far.
    pub fn flush_all(&self) -> StorageResult<()> {
        let last = self.state.lock().last_appended;
        self.flush_up_to(last)
    }

    /// Log a checkpoint record carrying the transaction table and dirty
    /// page table, then make it durable.
    pub fn checkpoint(
        &self,
        active_txns: Vec<(u64, Lsn)>,
        dirty_pages: Vec<(crate::storage::page::FileId, crate::storage::page::PageId, Lsn)>,
    ) -> StorageResult<Lsn> {
        let lsn = self.append(
            0,
            Lsn::INVALID,
            WalPayload::Checkpoint(super::record::CheckpointPayload {
                active_txns,
                dirty_pages,
            }),
        )?;
        self.flush_up_to(lsn)?;
        log::info!("checkpoint written at LSN {}", lsn);
        Ok(lsn)
    }

    /// Durable records with LSN >= `lsn`, for recovery scans.
    pub fn records_from(&self, lsn: Lsn) -> StorageResult<Vec<WalRecord>> {
        let mut records = self.read_all()?;
        records.retain(|r| r.lsn() >= lsn);
        Ok(records)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::Acquire))
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().last_appended
    }

    /// Read every durable record from the start of the log. Recovery-time
    /// corruption anywhere except the torn tail is fatal.
    pub fn read_all(&self) -> StorageResult<Vec<WalRecord>> {
        let mut state = self.state.lock();
        let (records, _valid_end) = read_frames(&mut state.file)?;
        state.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }
}

/// Scan frames from the start of the file. Returns the decoded records
/// and the byte offset of the end of the last valid frame. A frame cut
/// off by EOF is a torn tail and ends the scan; a checksum mismatch with
/// further data behind it is corruption.
fn read_frames(file: &mut File) -> StorageResult<(Vec<WalRecord>, u64)> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut records = Vec::new();
    let mut pos: u64 = 0;

    loop {
        if pos + FRAME_HEADER_SIZE as u64 > file_len {
            break;
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if pos + FRAME_HEADER_SIZE as u64 + len > file_len {
            // Torn tail from a crash mid-append
            break;
        }

        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            let frame_end = pos + FRAME_HEADER_SIZE as u64 + len;
            if frame_end >= file_len {
                break;
            }
            return Err(StorageError::Corruption(format!(
                "WAL frame checksum mismatch at offset {}",
                pos
            )));
        }

        let record = WalRecord::deserialize(&body)
            .map_err(|e| StorageError::Corruption(format!("malformed WAL record: {}", e)))?;
        records.push(record);
        pos += FRAME_HEADER_SIZE as u64 + len;
    }

    Ok((records, pos))
}
