//! WAL record format.
//!
//! Each record describes a single logical mutation to a named page:
//!
//! ```text
//! seq_num  u32
//! page_id  u32
//! redo_len u32
//! redo     <redo_len bytes>
//!
//! redo:
//!   type     u8  (1 Insert, 2 Update, 3 Remove)
//!   key_len  u32
//!   tail bytes:
//!     Insert: key bytes || (value bytes OR child-id bytes)
//!     Update: slot_index u32 || (value bytes OR child-id bytes)
//!     Remove: slot_index u32
//! ```
//!
//! Whether an Insert/Update payload carries value bytes or a child id is
//! resolved at replay time by the destination page's cell type; the log
//! itself is agnostic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cydb_common::page::PageId;
use cydb_common::{CydbError, Result};

/// Size of the fixed record header (seq_num, page_id, redo_len).
pub const RECORD_HEADER_SIZE: usize = 12;

/// Size of the fixed redo prefix (type, key_len).
pub const REDO_HEADER_SIZE: usize = 5;

/// Upper bound on a redo payload; anything larger is treated as corruption.
pub const MAX_REDO_SIZE: usize = 64 * 1024;

/// Discriminant byte of a redo operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedoType {
    /// Ordered cell insertion.
    Insert = 1,
    /// In-place cell update by slot index.
    Update = 2,
    /// Cell removal by slot index.
    Remove = 3,
}

impl TryFrom<u8> for RedoType {
    type Error = CydbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RedoType::Insert),
            2 => Ok(RedoType::Update),
            3 => Ok(RedoType::Remove),
            _ => Err(CydbError::WalCorrupted {
                offset: 0,
                reason: format!("invalid redo type: {}", value),
            }),
        }
    }
}

/// A logical redo operation against one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// Insert a cell; `payload` is the value (leaf) or child-id bytes (internal).
    Insert { key: Bytes, payload: Bytes },
    /// Update the cell at `slot`; `payload` as for Insert. A `slot` equal to
    /// the page's `data_num` updates `rightmost_child`.
    Update { slot: u32, payload: Bytes },
    /// Remove the cell at `slot`.
    Remove { slot: u32 },
}

impl RedoOp {
    /// Builds the child-id payload used by internal-node redo records.
    pub fn child_payload(child: PageId) -> Bytes {
        Bytes::copy_from_slice(&child.0.to_le_bytes())
    }

    /// Decodes a child id from an Insert/Update payload.
    pub fn decode_child(payload: &[u8]) -> Result<PageId> {
        if payload.len() != 4 {
            return Err(CydbError::WalCorrupted {
                offset: 0,
                reason: format!("child payload of {} bytes", payload.len()),
            });
        }
        Ok(PageId(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ])))
    }

    /// Returns the redo type discriminant.
    pub fn redo_type(&self) -> RedoType {
        match self {
            RedoOp::Insert { .. } => RedoType::Insert,
            RedoOp::Update { .. } => RedoType::Update,
            RedoOp::Remove { .. } => RedoType::Remove,
        }
    }

    /// Encoded size of the redo descriptor.
    pub fn encoded_len(&self) -> usize {
        REDO_HEADER_SIZE
            + match self {
                RedoOp::Insert { key, payload } => key.len() + payload.len(),
                RedoOp::Update { payload, .. } => 4 + payload.len(),
                RedoOp::Remove { .. } => 4,
            }
    }

    /// Appends the encoded redo descriptor to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.redo_type() as u8);
        match self {
            RedoOp::Insert { key, payload } => {
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
                buf.put_slice(payload);
            }
            RedoOp::Update { slot, payload } => {
                buf.put_u32_le(0);
                buf.put_u32_le(*slot);
                buf.put_slice(payload);
            }
            RedoOp::Remove { slot } => {
                buf.put_u32_le(0);
                buf.put_u32_le(*slot);
            }
        }
    }

    /// Decodes a redo descriptor. `offset` is the record's file position,
    /// used only for error reporting.
    pub fn decode(mut data: &[u8], offset: u64) -> Result<Self> {
        if data.len() < REDO_HEADER_SIZE {
            return Err(CydbError::WalCorrupted {
                offset,
                reason: "redo shorter than its header".to_string(),
            });
        }
        let redo_type = RedoType::try_from(data.get_u8()).map_err(|_| CydbError::WalCorrupted {
            offset,
            reason: "invalid redo type".to_string(),
        })?;
        let key_len = data.get_u32_le() as usize;

        match redo_type {
            RedoType::Insert => {
                if data.len() < key_len {
                    return Err(CydbError::WalCorrupted {
                        offset,
                        reason: "truncated insert key".to_string(),
                    });
                }
                let key = Bytes::copy_from_slice(&data[..key_len]);
                data.advance(key_len);
                let payload = Bytes::copy_from_slice(data);
                Ok(RedoOp::Insert { key, payload })
            }
            RedoType::Update => {
                if data.len() < 4 {
                    return Err(CydbError::WalCorrupted {
                        offset,
                        reason: "truncated update slot".to_string(),
                    });
                }
                let slot = data.get_u32_le();
                let payload = Bytes::copy_from_slice(data);
                Ok(RedoOp::Update { slot, payload })
            }
            RedoType::Remove => {
                if data.len() < 4 {
                    return Err(CydbError::WalCorrupted {
                        offset,
                        reason: "truncated remove slot".to_string(),
                    });
                }
                let slot = data.get_u32_le();
                Ok(RedoOp::Remove { slot })
            }
        }
    }
}

/// A single record in the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Monotonically increasing sequence number.
    pub seq_num: u32,
    /// Page the redo applies to.
    pub page_id: PageId,
    /// The logical operation.
    pub redo: RedoOp,
}

impl WalRecord {
    /// Total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        RECORD_HEADER_SIZE + self.redo.encoded_len()
    }

    /// Serializes this record to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());
        buf.put_u32_le(self.seq_num);
        buf.put_u32_le(self.page_id.0);
        buf.put_u32_le(self.redo.encoded_len() as u32);
        self.redo.encode_into(&mut buf);
        buf.freeze()
    }
}
