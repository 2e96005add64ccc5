//! Record header and chunk table: maps a node to its (possibly
//! non-contiguous) record ranges.
//!
//! Layout, starting at the node's first record:
//!
//! ```text
//! [1 byte: value type tag | 0x10 key-index flag]
//! [chunk table entries]*
//!   0x00                      end of table
//!   0x01 u16                  first-chunk length (records, incl. this one)
//!   0x02 u32 u16 u16          explicit range: page, record, length
//!   0x03 ...                  reserved (contiguous pages); read as corruption
//! [u16: bytes used in the last record]
//! ```
//!
//! The header may span record boundaries within the first chunk; parsing is
//! incremental so the reader can fetch more records on demand.

use crate::error::{ArborError, Result};
use crate::storage::address::{
    total_records, AllocatedRange, Allocation, RecordAddress,
};
use crate::types::ValueType;

const FLAG_KEY_INDEX: u8 = 0x10;

const ENTRY_END: u8 = 0;
const ENTRY_FIRST_LENGTH: u8 = 1;
const ENTRY_RANGE: u8 = 2;
const ENTRY_RESERVED_PAGES: u8 = 3;

/// In-memory descriptor of a stored node's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Address of the first record.
    pub address: RecordAddress,
    /// Stored value type.
    pub value_type: ValueType,
    /// Whether the node's children are behind a B+Tree key index.
    pub has_key_index: bool,
    /// Ordered record ranges of the node.
    pub allocation: Allocation,
    /// Byte length of the record header (flag byte + chunk table + length
    /// field).
    pub header_len: usize,
    /// Bytes used in the final record.
    pub last_record_len: u16,
}

impl RecordInfo {
    /// Serialized payload length in bytes (allocation minus header and the
    /// unused tail of the last record).
    pub fn payload_len(&self, record_size: usize) -> u64 {
        let records = total_records(&self.allocation);
        (records - 1) * record_size as u64 + u64::from(self.last_record_len)
            - self.header_len as u64
    }
}

/// Encodes the header for a node stored in `allocation`.
///
/// The first range of the allocation starts at the node's address, so only
/// its length is written; later ranges are explicit.
pub fn encode_header(
    value_type: ValueType,
    has_key_index: bool,
    allocation: &[AllocatedRange],
    last_record_len: u16,
) -> Result<Vec<u8>> {
    let first = allocation.first().ok_or_else(|| {
        ArborError::Internal("cannot encode header for empty allocation".into())
    })?;
    let mut bytes = Vec::with_capacity(header_len_for(allocation));
    let mut flag = value_type.tag();
    if has_key_index {
        flag |= FLAG_KEY_INDEX;
    }
    bytes.push(flag);
    if first.length > 1 {
        bytes.push(ENTRY_FIRST_LENGTH);
        bytes.extend_from_slice(&first.length.to_be_bytes());
    }
    for range in &allocation[1..] {
        bytes.push(ENTRY_RANGE);
        bytes.extend_from_slice(&range.page_nr.to_be_bytes());
        bytes.extend_from_slice(&range.record_nr.to_be_bytes());
        bytes.extend_from_slice(&range.length.to_be_bytes());
    }
    bytes.push(ENTRY_END);
    bytes.extend_from_slice(&last_record_len.to_be_bytes());
    Ok(bytes)
}

/// Byte length the header will occupy for a given allocation shape.
pub fn header_len_for(allocation: &[AllocatedRange]) -> usize {
    let first_entry = match allocation.first() {
        Some(range) if range.length > 1 => 3,
        _ => 0,
    };
    let range_entries = allocation.len().saturating_sub(1) * 9;
    1 + first_entry + range_entries + 1 + 2
}

/// Incrementally parses a record header. Returns `None` when `bytes` does
/// not yet hold the complete header; the caller reads further records of the
/// first chunk and retries.
pub fn parse_header(address: RecordAddress, bytes: &[u8]) -> Result<Option<RecordInfo>> {
    let Some(&flag) = bytes.first() else {
        return Ok(None);
    };
    let value_type = ValueType::from_tag(flag & 0x0F)?;
    let has_key_index = flag & FLAG_KEY_INDEX != 0;

    let mut pos = 1usize;
    let mut first_length: u16 = 1;
    let mut tail_ranges: Vec<AllocatedRange> = Vec::new();
    loop {
        let Some(&entry) = bytes.get(pos) else {
            return Ok(None);
        };
        pos += 1;
        match entry {
            ENTRY_END => break,
            ENTRY_FIRST_LENGTH => {
                let Some(raw) = bytes.get(pos..pos + 2) else {
                    return Ok(None);
                };
                first_length = u16::from_be_bytes([raw[0], raw[1]]);
                if first_length == 0 {
                    return Err(ArborError::Corruption(
                        "chunk table declares empty first chunk".into(),
                    ));
                }
                pos += 2;
            }
            ENTRY_RANGE => {
                let Some(raw) = bytes.get(pos..pos + 8) else {
                    return Ok(None);
                };
                let page_nr = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let record_nr = u16::from_be_bytes([raw[4], raw[5]]);
                let length = u16::from_be_bytes([raw[6], raw[7]]);
                if length == 0 {
                    return Err(ArborError::Corruption(
                        "chunk table contains empty range".into(),
                    ));
                }
                tail_ranges.push(AllocatedRange::new(page_nr, record_nr, length)?);
                pos += 8;
            }
            ENTRY_RESERVED_PAGES => {
                return Err(ArborError::Corruption(
                    "reserved contiguous-pages chunk entry encountered".into(),
                ));
            }
            other => {
                return Err(ArborError::Corruption(format!(
                    "unknown chunk table entry type {other}"
                )));
            }
        }
    }
    let Some(raw) = bytes.get(pos..pos + 2) else {
        return Ok(None);
    };
    let last_record_len = u16::from_be_bytes([raw[0], raw[1]]);
    pos += 2;

    let mut allocation: Allocation = Allocation::new();
    allocation.push(AllocatedRange::new(
        address.page_nr,
        address.record_nr,
        first_length,
    )?);
    allocation.extend(tail_ranges);

    Ok(Some(RecordInfo {
        address,
        value_type,
        has_key_index,
        allocation,
        header_len: pos,
        last_record_len,
    }))
}
