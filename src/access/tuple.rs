//! Tuple version format.
//!
//! Every heap record is a version: a small header naming the creating
//! and deleting transactions plus an optional back-pointer to the prior
//! version, followed by the raw row bytes. Chains are threaded by
//! (page, slot) within the same heap file, never by memory pointers, so
//! they stay valid across buffer evictions.

use crate::storage::page::PageId;
use crate::storage::wal::RowLocation;
use crate::storage::{StorageError, StorageResult};

/// Durable address of a row version: (file, page, slot).
pub type RowId = RowLocation;

/// Transaction id. Zero is reserved (no transaction).
pub type TxnId = u64;

const FLAG_HAS_PREV: u8 = 1;
/// xmin + xmax + flag byte.
pub const VERSION_HEADER_SIZE: usize = 17;
const PREV_POINTER_SIZE: usize = 6;

/// MVCC header prepended to every stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHeader {
    /// Creating transaction.
    pub xmin: TxnId,
    /// Deleting transaction, 0 while the version is live.
    pub xmax: TxnId,
    /// Prior version in the chain, within the same heap file.
    pub prev: Option<(PageId, u16)>,
}

impl VersionHeader {
    pub fn new(xmin: TxnId) -> Self {
        Self {
            xmin,
            xmax: 0,
            prev: None,
        }
    }

    pub fn with_prev(xmin: TxnId, prev: (PageId, u16)) -> Self {
        Self {
            xmin,
            xmax: 0,
            prev: Some(prev),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.xmax != 0
    }

    pub fn encoded_len(&self) -> usize {
        match self.prev {
            Some(_) => VERSION_HEADER_SIZE + PREV_POINTER_SIZE,
            None => VERSION_HEADER_SIZE,
        }
    }
}

/// One row version: header plus the row bytes the caller stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub header: VersionHeader,
    pub payload: Vec<u8>,
}

impl Tuple {
    pub fn new(header: VersionHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.encoded_len() + self.payload.len());
        out.extend_from_slice(&self.header.xmin.to_le_bytes());
        out.extend_from_slice(&self.header.xmax.to_le_bytes());
        match self.header.prev {
            Some((page, slot)) => {
                out.push(FLAG_HAS_PREV);
                out.extend_from_slice(&page.0.to_le_bytes());
                out.extend_from_slice(&slot.to_le_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Tuple> {
        if bytes.len() < VERSION_HEADER_SIZE {
            return Err(StorageError::Corruption(
                "tuple shorter than version header".into(),
            ));
        }
        let xmin = u64::from_le_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| StorageError::Corruption("bad tuple header".into()))?,
        );
        let xmax = u64::from_le_bytes(
            bytes[8..16]
                .try_into()
                .map_err(|_| StorageError::Corruption("bad tuple header".into()))?,
        );
        let flag = bytes[16];
        let (prev, body_start) = if flag & FLAG_HAS_PREV != 0 {
            if bytes.len() < VERSION_HEADER_SIZE + PREV_POINTER_SIZE {
                return Err(StorageError::Corruption(
                    "tuple truncated inside back-pointer".into(),
                ));
            }
            let page = u32::from_le_bytes(
                bytes[17..21]
                    .try_into()
                    .map_err(|_| StorageError::Corruption("bad tuple header".into()))?,
            );
            let slot = u16::from_le_bytes(
                bytes[21..23]
                    .try_into()
                    .map_err(|_| StorageError::Corruption("bad tuple header".into()))?,
            );
            (
                Some((PageId(page), slot)),
                VERSION_HEADER_SIZE + PREV_POINTER_SIZE,
            )
        } else {
            (None, VERSION_HEADER_SIZE)
        };

        Ok(Tuple {
            header: VersionHeader { xmin, xmax, prev },
            payload: bytes[body_start..].to_vec(),
        })
    }
}
