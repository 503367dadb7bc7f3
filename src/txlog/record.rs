//! On-disk layout of the transaction log.
//!
//! ```text
//! header (32 bytes):
//!   magic "XATXLOG1" | version u16 | min offset u64 | max offset u64 | reserved
//! record:
//!   live u8 | key [u8; 24] | op u8 | total length u16 | payload length u16 | payload
//! ```
//!
//! All integers are little-endian. Payloads are bincode-encoded archives or branch
//! records.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Cursor, Read};

use super::error::{LogError, LogResult};
use crate::branch::BranchRecord;
use crate::transaction::{GlobalId, TransactionArchive, GLOBAL_ID_LEN};

/// Magic bytes at the start of every log file.
pub const MAGIC: &[u8; 8] = b"XATXLOG1";

/// Current header version.
pub const VERSION: u16 = 1;

/// Size of the file header in bytes.
pub const HEADER_SIZE: u64 = 32;

/// Size of a record without its payload.
pub const RECORD_FIXED_LEN: usize = 1 + GLOBAL_ID_LEN + 1 + 2 + 2;

/// Largest payload that fits the 16-bit total length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - RECORD_FIXED_LEN;

/// Offset of the live flag inside a record.
pub const LIVE_FLAG_OFFSET: u64 = 0;

/// File header: the valid record range is `[min_offset, max_offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u16,
    pub min_offset: u64,
    pub max_offset: u64,
}

impl LogHeader {
    /// Header of an empty log.
    pub fn empty() -> Self {
        Self {
            version: VERSION,
            min_offset: HEADER_SIZE,
            max_offset: HEADER_SIZE,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(MAGIC);
        // Writing into a Vec cannot fail.
        let _ = buf.write_u16::<LittleEndian>(self.version);
        let _ = buf.write_u64::<LittleEndian>(self.min_offset);
        let _ = buf.write_u64::<LittleEndian>(self.max_offset);
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    /// Deserialize from bytes, validating magic, version and range.
    pub fn from_bytes(bytes: &[u8]) -> LogResult<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(LogError::InvalidHeader(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(LogError::InvalidHeader("bad magic".to_string()));
        }

        let version = cursor.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(LogError::InvalidHeader(format!(
                "unsupported version {}",
                version
            )));
        }
        let min_offset = cursor.read_u64::<LittleEndian>()?;
        let max_offset = cursor.read_u64::<LittleEndian>()?;
        if min_offset < HEADER_SIZE || max_offset < min_offset {
            return Err(LogError::InvalidHeader(format!(
                "invalid range [{}, {})",
                min_offset, max_offset
            )));
        }

        Ok(Self {
            version,
            min_offset,
            max_offset,
        })
    }
}

impl Default for LogHeader {
    fn default() -> Self {
        Self::empty()
    }
}

/// Record operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogOp {
    AddTransaction = 1,
    ModifyTransaction = 2,
    DeleteTransaction = 3,
    ModifyBranch = 4,
}

impl LogOp {
    /// True for records carrying a full archive.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::AddTransaction | Self::ModifyTransaction)
    }
}

impl TryFrom<u8> for LogOp {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AddTransaction),
            2 => Ok(Self::ModifyTransaction),
            3 => Ok(Self::DeleteTransaction),
            4 => Ok(Self::ModifyBranch),
            other => Err(other),
        }
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub live: bool,
    pub key: GlobalId,
    pub op: LogOp,
    pub payload: Vec<u8>,
}

impl LogRecord {
    fn with_payload(key: GlobalId, op: LogOp, payload: Vec<u8>) -> LogResult<Self> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(LogError::RecordTooLarge {
                size: payload.len() + RECORD_FIXED_LEN,
                max: u16::MAX as usize,
            });
        }
        Ok(Self {
            live: true,
            key,
            op,
            payload,
        })
    }

    pub fn add(archive: &TransactionArchive) -> LogResult<Self> {
        Self::with_payload(
            archive.global_id,
            LogOp::AddTransaction,
            bincode::serialize(archive)?,
        )
    }

    pub fn modify(archive: &TransactionArchive) -> LogResult<Self> {
        Self::with_payload(
            archive.global_id,
            LogOp::ModifyTransaction,
            bincode::serialize(archive)?,
        )
    }

    pub fn delete(global_id: GlobalId) -> LogResult<Self> {
        Self::with_payload(global_id, LogOp::DeleteTransaction, Vec::new())
    }

    pub fn modify_branch(global_id: GlobalId, record: &BranchRecord) -> LogResult<Self> {
        Self::with_payload(
            global_id,
            LogOp::ModifyBranch,
            bincode::serialize(record)?,
        )
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(u8::from(self.live));
        buf.put_slice(self.key.as_bytes());
        buf.put_u8(self.op as u8);
        buf.put_u16_le(self.encoded_len() as u16);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    /// Decodes the record at the start of `buf`. `offset` is only used in errors.
    /// Returns the record and its encoded length.
    pub fn decode(mut buf: &[u8], offset: u64) -> LogResult<(Self, usize)> {
        let corrupt = |reason: String| LogError::CorruptRecord { offset, reason };

        if buf.len() < RECORD_FIXED_LEN {
            return Err(corrupt(format!("truncated header ({} bytes)", buf.len())));
        }

        let live = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(corrupt(format!("bad live flag {}", other))),
        };
        let mut key = [0u8; GLOBAL_ID_LEN];
        buf.copy_to_slice(&mut key);
        let op = LogOp::try_from(buf.get_u8())
            .map_err(|code| corrupt(format!("unknown op {}", code)))?;
        let total_len = buf.get_u16_le() as usize;
        let payload_len = buf.get_u16_le() as usize;

        if total_len != RECORD_FIXED_LEN + payload_len {
            return Err(corrupt(format!(
                "length mismatch: total {} payload {}",
                total_len, payload_len
            )));
        }
        if buf.remaining() < payload_len {
            return Err(corrupt(format!(
                "truncated payload ({} of {} bytes)",
                buf.remaining(),
                payload_len
            )));
        }

        let record = Self {
            live,
            key: GlobalId::from_bytes(key),
            op,
            payload: buf[..payload_len].to_vec(),
        };
        Ok((record, total_len))
    }

    pub fn archive(&self) -> LogResult<TransactionArchive> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn branch(&self) -> LogResult<BranchRecord> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Iterates over the records of a log region, yielding each record with its absolute
/// offset. Stops at the first frame that cannot be decoded.
pub struct RecordIter<'a> {
    region: &'a [u8],
    base: u64,
    pos: usize,
    error: Option<LogError>,
}

impl<'a> RecordIter<'a> {
    /// `region` holds the bytes starting at file offset `base`.
    pub fn new(region: &'a [u8], base: u64) -> Self {
        Self {
            region,
            base,
            pos: 0,
            error: None,
        }
    }

    /// The error that ended iteration early, if any.
    pub fn take_error(&mut self) -> Option<LogError> {
        self.error.take()
    }
}

impl Iterator for RecordIter<'_> {
    type Item = (u64, LogRecord, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.region.len() || self.error.is_some() {
            return None;
        }
        let offset = self.base + self.pos as u64;
        match LogRecord::decode(&self.region[self.pos..], offset) {
            Ok((record, len)) => {
                self.pos += len;
                Some((offset, record, len))
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionStatus, XidFactory};

    fn archive() -> TransactionArchive {
        let factory = XidFactory::new(7);
        TransactionArchive::new(factory.create_global_id(), TransactionStatus::Prepared, true)
    }

    #[test]
    fn test_header_layout() {
        let header = LogHeader {
            version: VERSION,
            min_offset: HEADER_SIZE,
            max_offset: 1000,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(&bytes[18..26], &1000u64.to_le_bytes());
        assert_eq!(LogHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(LogHeader::from_bytes(&[0u8; 8]).is_err());
        assert!(LogHeader::from_bytes(&[0u8; HEADER_SIZE as usize]).is_err());

        let mut bytes = LogHeader::empty().to_bytes();
        bytes[18..26].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            LogHeader::from_bytes(&bytes),
            Err(LogError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_record_layout() {
        let archive = archive();
        let record = LogRecord::add(&archive).unwrap();
        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        assert_eq!(buf.len(), record.encoded_len());
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..25], archive.global_id.as_bytes());
        assert_eq!(buf[25], LogOp::AddTransaction as u8);
        assert_eq!(
            u16::from_le_bytes([buf[26], buf[27]]) as usize,
            record.encoded_len()
        );

        let (decoded, len) = LogRecord::decode(&buf, HEADER_SIZE).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(decoded.archive().unwrap(), archive);
    }

    #[test]
    fn test_decode_detects_corruption() {
        let record = LogRecord::delete(archive().global_id).unwrap();
        let mut buf = BytesMut::new();
        record.encode(&mut buf);

        let mut bad_len = buf.clone();
        bad_len[26] = 0xff;
        assert!(matches!(
            LogRecord::decode(&bad_len, 40),
            Err(LogError::CorruptRecord { offset: 40, .. })
        ));

        let mut bad_op = buf.clone();
        bad_op[25] = 9;
        assert!(LogRecord::decode(&bad_op, 0).is_err());

        assert!(LogRecord::decode(&buf[..RECORD_FIXED_LEN - 1], 0).is_err());
    }

    #[test]
    fn test_record_too_large() {
        let gid = archive().global_id;
        let result = LogRecord::with_payload(gid, LogOp::ModifyTransaction, vec![0; 70_000]);
        assert!(matches!(result, Err(LogError::RecordTooLarge { .. })));
    }

    #[test]
    fn test_iterator_stops_at_torn_tail() {
        let gid = archive().global_id;
        let mut buf = BytesMut::new();
        LogRecord::delete(gid).unwrap().encode(&mut buf);
        LogRecord::delete(gid).unwrap().encode(&mut buf);
        buf.put_slice(&[1, 2, 3]);

        let mut iter = RecordIter::new(&buf, HEADER_SIZE);
        let offsets: Vec<u64> = iter.by_ref().map(|(offset, _, _)| offset).collect();
        assert_eq!(
            offsets,
            vec![HEADER_SIZE, HEADER_SIZE + RECORD_FIXED_LEN as u64]
        );
        assert!(iter.take_error().is_some());
    }
}
