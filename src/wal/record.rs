//! Log record definitions
//!
//! Defines the structure of individual log records and their on-disk frame.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::op::OpCode;
use crate::storage::ResourceRef;
use crate::txn::{TxnId, NON_TRANSACTIONAL};
use crate::AtlasError;

/// Frame header: LSN (8) + body length (4) + header CRC (4) + body CRC (4)
pub const HEADER_SIZE: usize = 20;

/// Upper bound on a single record body; larger lengths are treated as garbage
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// What a log record means to recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    /// An undoable change
    Normal,
    /// Reversal of an earlier Normal record; never undone itself
    Compensation,
    /// Active transaction / dirty resource snapshot
    Checkpoint,
    /// Transaction committed
    Commit,
    /// Transaction fully rolled back
    AbortComplete,
}

/// A single record in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log Sequence Number, assigned by the log manager on append
    pub lsn: Lsn,

    /// Owning transaction (0 for checkpoint records)
    pub txn_id: TxnId,

    /// Previous record of the same transaction
    pub prev_lsn: Option<Lsn>,

    /// Mutated resource, opaque to the log
    pub resource: Option<ResourceRef>,

    pub kind: RecordKind,

    /// Where undo resumes after this record (compensations only)
    pub undo_next_lsn: Option<Lsn>,

    /// Codec used for the payload
    pub op_code: OpCode,

    /// Encoded operation
    pub payload: Vec<u8>,
}

/// Serialized part of a record (everything but the LSN, which lives in the header)
#[derive(Serialize)]
struct BodyRef<'a> {
    txn_id: TxnId,
    prev_lsn: Option<Lsn>,
    resource: &'a Option<ResourceRef>,
    kind: RecordKind,
    undo_next_lsn: Option<Lsn>,
    op_code: OpCode,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct Body {
    txn_id: TxnId,
    prev_lsn: Option<Lsn>,
    resource: Option<ResourceRef>,
    kind: RecordKind,
    undo_next_lsn: Option<Lsn>,
    op_code: OpCode,
    payload: Vec<u8>,
}

/// Result of decoding one frame from a byte buffer
#[derive(Debug)]
pub enum Frame {
    /// A whole, valid record and the number of bytes it occupied
    Complete(LogRecord, usize),
    /// The buffer ends before the frame does
    Incomplete,
    /// The frame is all there but fails integrity checks
    Corrupt(String),
}

impl LogRecord {
    /// A change made by `txn_id`; the LSN is filled in on append
    pub fn normal(
        txn_id: TxnId,
        prev_lsn: Option<Lsn>,
        resource: ResourceRef,
        op_code: OpCode,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            lsn: Lsn(0),
            txn_id,
            prev_lsn,
            resource: Some(resource),
            kind: RecordKind::Normal,
            undo_next_lsn: None,
            op_code,
            payload,
        }
    }

    /// The compensation for an undone record
    pub fn compensation(
        txn_id: TxnId,
        prev_lsn: Option<Lsn>,
        resource: ResourceRef,
        undo_next_lsn: Option<Lsn>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            lsn: Lsn(0),
            txn_id,
            prev_lsn,
            resource: Some(resource),
            kind: RecordKind::Compensation,
            undo_next_lsn,
            op_code: OpCode::COMPENSATION,
            payload,
        }
    }

    pub fn commit(txn_id: TxnId, prev_lsn: Option<Lsn>) -> Self {
        Self::marker(txn_id, prev_lsn, RecordKind::Commit)
    }

    pub fn abort_complete(txn_id: TxnId, prev_lsn: Option<Lsn>) -> Self {
        Self::marker(txn_id, prev_lsn, RecordKind::AbortComplete)
    }

    pub fn checkpoint(payload: Vec<u8>) -> Self {
        Self {
            lsn: Lsn(0),
            txn_id: NON_TRANSACTIONAL,
            prev_lsn: None,
            resource: None,
            kind: RecordKind::Checkpoint,
            undo_next_lsn: None,
            op_code: OpCode::CHECKPOINT,
            payload,
        }
    }

    fn marker(txn_id: TxnId, prev_lsn: Option<Lsn>, kind: RecordKind) -> Self {
        Self {
            lsn: Lsn(0),
            txn_id,
            prev_lsn,
            resource: None,
            kind,
            undo_next_lsn: None,
            op_code: OpCode::NONE,
            payload: Vec::new(),
        }
    }

    /// Encode into a frame: [LSN (8)][Len (4)][Header CRC (4)][Body CRC (4)][Body]
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(&BodyRef {
            txn_id: self.txn_id,
            prev_lsn: self.prev_lsn,
            resource: &self.resource,
            kind: self.kind,
            undo_next_lsn: self.undo_next_lsn,
            op_code: self.op_code,
            payload: &self.payload,
        })?;

        if body.len() > MAX_BODY_SIZE {
            return Err(AtlasError::Serialization(format!(
                "record body of {} bytes exceeds limit",
                body.len()
            )));
        }

        let lsn_bytes = self.lsn.as_u64().to_le_bytes();
        let len_bytes = (body.len() as u32).to_le_bytes();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_slice(&lsn_bytes);
        buf.put_slice(&len_bytes);
        buf.put_u32_le(header_crc(&lsn_bytes, &len_bytes));
        buf.put_u32_le(body_crc(&lsn_bytes, &body));
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    /// Decode a frame that must be complete and valid
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match decode_frame(bytes) {
            Frame::Complete(record, _) => Ok(record),
            Frame::Incomplete => Err(AtlasError::LogCorruption {
                offset: 0,
                reason: "incomplete frame".to_string(),
            }),
            Frame::Corrupt(reason) => Err(AtlasError::LogCorruption { offset: 0, reason }),
        }
    }

    /// Size of this record's frame on disk
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(self.serialize()?.len())
    }
}

/// A frame header whose own checksum verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub lsn: Lsn,
    pub body_len: usize,
    pub body_crc: u32,
}

/// Parse and verify the fixed-size header
///
/// A header that fails its checksum cannot be trusted for anything,
/// including the length of the frame it starts.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> std::result::Result<FrameHeader, String> {
    let mut word = [0u8; 8];
    word.copy_from_slice(&header[0..8]);
    let lsn = Lsn(u64::from_le_bytes(word));

    let mut half = [0u8; 4];
    half.copy_from_slice(&header[8..12]);
    let body_len = u32::from_le_bytes(half) as usize;
    half.copy_from_slice(&header[12..16]);
    let stored = u32::from_le_bytes(half);
    half.copy_from_slice(&header[16..20]);
    let body_crc = u32::from_le_bytes(half);

    let actual = header_crc(&header[0..8], &header[8..12]);
    if actual != stored {
        return Err(format!(
            "header CRC mismatch (stored {:#010x}, computed {:#010x})",
            stored, actual
        ));
    }
    if body_len > MAX_BODY_SIZE {
        return Err(format!("body length {} exceeds limit", body_len));
    }

    Ok(FrameHeader {
        lsn,
        body_len,
        body_crc,
    })
}

/// Verify and decode a frame body whose header was already checked
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> std::result::Result<LogRecord, String> {
    let lsn = header.lsn;
    let actual = body_crc(&lsn.as_u64().to_le_bytes(), body);
    if actual != header.body_crc {
        return Err(format!(
            "CRC mismatch for LSN {} (stored {:#010x}, computed {:#010x})",
            lsn, header.body_crc, actual
        ));
    }

    let body: Body = bincode::deserialize(body)
        .map_err(|e| format!("undecodable body for LSN {}: {}", lsn, e))?;

    Ok(LogRecord {
        lsn,
        txn_id: body.txn_id,
        prev_lsn: body.prev_lsn,
        resource: body.resource,
        kind: body.kind,
        undo_next_lsn: body.undo_next_lsn,
        op_code: body.op_code,
        payload: body.payload,
    })
}

/// Decode one frame from the start of `bytes`
pub fn decode_frame(bytes: &[u8]) -> Frame {
    if bytes.len() < HEADER_SIZE {
        return Frame::Incomplete;
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = match decode_header(&raw) {
        Ok(header) => header,
        Err(reason) => return Frame::Corrupt(reason),
    };

    let Some(body) = bytes.get(HEADER_SIZE..HEADER_SIZE + header.body_len) else {
        return Frame::Incomplete;
    };

    match decode_body(&header, body) {
        Ok(record) => Frame::Complete(record, HEADER_SIZE + header.body_len),
        Err(reason) => Frame::Corrupt(reason),
    }
}

fn header_crc(lsn_bytes: &[u8], len_bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(lsn_bytes);
    hasher.update(len_bytes);
    hasher.finalize()
}

fn body_crc(lsn_bytes: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(lsn_bytes);
    hasher.update(body);
    hasher.finalize()
}
