//! Binary record codec
//!
//! One mutation record is encoded as a flat payload:
//!
//! ```text
//! [op:1][origin_id:4 LE][logical_time:4 LE][key_len:4 LE][key][value]
//! ```
//!
//! The value length is implicit: payload length minus header minus key
//! length. Payloads never travel bare - on disk and in batch blobs each
//! payload sits inside a frame `[len:4 LE][crc32:4 LE][payload]`, so the
//! payload length is always known. A truncated trailing frame in a blob
//! is a decode error, never a silent truncation.

use crate::error::{Error, Result};

/// Fixed payload header size: op + origin_id + logical_time + key_len.
pub const RECORD_HEADER_LEN: usize = 13;

/// Frame header size: length + crc32.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload. Anything larger is treated as
/// corruption rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Mutation operation carried by a record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    /// Set key to value
    Set = 1,
    /// Delete key
    Delete = 2,
    /// Set key expiry (value holds the expiry timestamp)
    ExpireAt = 3,
}

impl TryFrom<u8> for RecordOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Set),
            2 => Ok(Self::Delete),
            3 => Ok(Self::ExpireAt),
            _ => Err(Error::corruption(format!("unknown record op: {}", value))),
        }
    }
}

/// One mutation record. Immutable once created: built by the inbound
/// command layer, copied into a segment file by the writer, read back by
/// any number of readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Operation
    pub op: RecordOp,
    /// Key bytes
    pub key: Vec<u8>,
    /// Value bytes (expiry timestamp text for `ExpireAt`, empty for `Delete`)
    pub value: Vec<u8>,
    /// Identifier of the cluster that originated the write
    pub origin_id: i32,
    /// Caller-supplied recency stamp for last-write-wins dedup
    pub logical_time: i32,
}

impl LogRecord {
    /// Create a new record.
    pub fn new(
        op: RecordOp,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        origin_id: i32,
        logical_time: i32,
    ) -> Self {
        Self {
            op,
            key: key.into(),
            value: value.into(),
            origin_id,
            logical_time,
        }
    }

    /// Encode to the flat payload layout.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + self.key.len() + self.value.len());
        buf.push(self.op as u8);
        buf.extend_from_slice(&self.origin_id.to_le_bytes());
        buf.extend_from_slice(&self.logical_time.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Decode from a flat payload. The declared key length is validated
    /// against the remaining buffer.
    pub fn decode_payload(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(Error::corruption(format!(
                "record payload too short: {} bytes",
                buf.len()
            )));
        }
        let op = RecordOp::try_from(buf[0])?;
        let origin_id = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        let logical_time = i32::from_le_bytes(buf[5..9].try_into().unwrap());
        let key_len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
        if RECORD_HEADER_LEN + key_len > buf.len() {
            return Err(Error::corruption(format!(
                "key length {} exceeds remaining {} bytes",
                key_len,
                buf.len() - RECORD_HEADER_LEN
            )));
        }
        let key = buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + key_len].to_vec();
        let value = buf[RECORD_HEADER_LEN + key_len..].to_vec();
        Ok(Self {
            op,
            key,
            value,
            origin_id,
            logical_time,
        })
    }

    /// Encode as a complete frame `[len][crc32][payload]`, the unit both
    /// the segment files and batch blobs are built from.
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Framed size of this record.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + RECORD_HEADER_LEN + self.key.len() + self.value.len()
    }
}

/// Lazy iterator over concatenated frames in a blob.
///
/// Stops cleanly at the end of the buffer; a partial trailing frame or a
/// checksum mismatch yields a corruption error.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameIter<'a> {
    /// Iterate over the frames in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Byte position of the next unread frame.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = &self.buf[self.pos..];
        if remaining.is_empty() {
            return None;
        }
        if remaining.len() < FRAME_HEADER_LEN {
            return Some(Err(Error::corruption("partial trailing frame header")));
        }
        let len = u32::from_le_bytes(remaining[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Some(Err(Error::corruption(format!(
                "frame length {} exceeds maximum",
                len
            ))));
        }
        let crc = u32::from_le_bytes(remaining[4..8].try_into().unwrap());
        if remaining.len() < FRAME_HEADER_LEN + len {
            return Some(Err(Error::corruption("partial trailing frame payload")));
        }
        let payload = &remaining[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
        if crc32fast::hash(payload) != crc {
            return Some(Err(Error::corruption("frame checksum mismatch")));
        }
        self.pos += FRAME_HEADER_LEN + len;
        Some(LogRecord::decode_payload(payload))
    }
}

/// Decode every record in a batch blob.
pub fn decode_all(buf: &[u8]) -> Result<Vec<LogRecord>> {
    FrameIter::new(buf).collect()
}

/// The 16-byte position blob carried by the wire mutation commands:
/// `(logical_time: u32, sequence: u32, byte_offset: u64)`, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionBlob {
    /// Recency stamp of the mutation
    pub logical_time: u32,
    /// Log segment sequence number
    pub sequence: u32,
    /// Byte offset within the segment
    pub offset: u64,
}

impl PositionBlob {
    /// Packed size on the wire.
    pub const LEN: usize = 16;

    /// Pack to the wire layout.
    pub fn pack(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..4].copy_from_slice(&self.logical_time.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Unpack from the wire layout.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(Error::protocol(format!(
                "position blob must be {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }
        Ok(Self {
            logical_time: u32::from_le_bytes(buf[..4].try_into().unwrap()),
            sequence: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        LogRecord::new(RecordOp::Set, b"k1".to_vec(), b"v1".to_vec(), 7, 42)
    }

    #[test]
    fn test_payload_roundtrip() {
        let rec = sample();
        let decoded = LogRecord::decode_payload(&rec.encode_payload()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_empty_value() {
        let rec = LogRecord::new(RecordOp::Delete, b"gone".to_vec(), Vec::new(), -1, 0);
        let decoded = LogRecord::decode_payload(&rec.encode_payload()).unwrap();
        assert_eq!(decoded.value, Vec::<u8>::new());
        assert_eq!(decoded.op, RecordOp::Delete);
    }

    #[test]
    fn test_bad_op_rejected() {
        let mut payload = sample().encode_payload();
        payload[0] = 99;
        assert!(matches!(
            LogRecord::decode_payload(&payload),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_key_len_overflow_rejected() {
        let mut payload = sample().encode_payload();
        // Declare a key longer than the payload.
        payload[9..13].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            LogRecord::decode_payload(&payload),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_frame_iter_multiple() {
        let a = LogRecord::new(RecordOp::Set, b"a".to_vec(), b"1".to_vec(), 1, 1);
        let b = LogRecord::new(RecordOp::Delete, b"b".to_vec(), Vec::new(), 2, 2);
        let mut blob = a.encode_frame();
        blob.extend_from_slice(&b.encode_frame());
        let records = decode_all(&blob).unwrap();
        assert_eq!(records, vec![a, b]);
    }

    #[test]
    fn test_frame_iter_partial_trailing() {
        let mut blob = sample().encode_frame();
        blob.truncate(blob.len() - 1);
        let result = decode_all(&blob);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_frame_iter_crc_mismatch() {
        let mut blob = sample().encode_frame();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let result = decode_all(&blob);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_frame_iter_empty() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_position_blob_roundtrip() {
        let blob = PositionBlob {
            logical_time: 100,
            sequence: 3,
            offset: 1 << 33,
        };
        assert_eq!(PositionBlob::unpack(&blob.pack()).unwrap(), blob);
    }

    #[test]
    fn test_position_blob_wrong_len() {
        assert!(PositionBlob::unpack(&[0u8; 15]).is_err());
    }
}
