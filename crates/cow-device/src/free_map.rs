//! On-disk encoding of the free-space map.
//!
//! ```text
//! +------------------+---------+
//! | magic            | 4 bytes | = FREE_MAP_MAGIC
//! | version          | 2 bytes | = 1
//! | reserved         | 2 bytes |
//! | range_count      | 8 bytes |
//! +------------------+---------+
//! | For each range (ascending):|
//! |   start          | 8 bytes |
//! |   len            | 8 bytes |
//! +------------------+---------+
//! ```
//!
//! The CRC32c of the encoded bytes lives in the superblock, not here.

use cow_alloc::FreeSpaceMap;
use cow_types::{ParseError, read_le_u16, read_le_u32, read_le_u64};

pub const FREE_MAP_MAGIC: u32 = 0x434D_4650;
pub const FREE_MAP_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
pub const ENTRY_SIZE: usize = 16;

/// Encoded size of a map holding `ranges` ranges.
#[must_use]
pub fn encoded_len(ranges: usize) -> usize {
    HEADER_SIZE + ranges * ENTRY_SIZE
}

#[must_use]
pub fn encode_free_map(map: &FreeSpaceMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(map.range_count()));
    buf.extend_from_slice(&FREE_MAP_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FREE_MAP_VERSION.to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes());
    buf.extend_from_slice(&(map.range_count() as u64).to_le_bytes());
    for range in map.ranges() {
        buf.extend_from_slice(&range.start.to_le_bytes());
        buf.extend_from_slice(&(range.end - range.start).to_le_bytes());
    }
    buf
}

/// Decode a map and check it against the managed length it describes.
///
/// Ranges must be non-empty, ascending, non-adjacent and end at or before
/// `managed_len`.
pub fn decode_free_map(bytes: &[u8], managed_len: u64) -> Result<FreeSpaceMap, ParseError> {
    let magic = read_le_u32(bytes, 0)?;
    if magic != FREE_MAP_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(FREE_MAP_MAGIC),
            actual: u64::from(magic),
        });
    }
    if read_le_u16(bytes, 4)? != FREE_MAP_VERSION {
        return Err(ParseError::InvalidField {
            field: "free_map_version",
            reason: "unsupported",
        });
    }
    let count = usize::try_from(read_le_u64(bytes, 8)?)
        .map_err(|_| ParseError::IntegerConversion { field: "range_count" })?;
    let needed = count
        .checked_mul(ENTRY_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or(ParseError::IntegerConversion { field: "range_count" })?;
    if needed > bytes.len() {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 0,
            actual: bytes.len(),
        });
    }

    let mut map = FreeSpaceMap::new();
    let mut prev_end: Option<u64> = None;
    for i in 0..count {
        let offset = HEADER_SIZE + i * ENTRY_SIZE;
        let start = read_le_u64(bytes, offset)?;
        let len = read_le_u64(bytes, offset + 8)?;
        let end = start.checked_add(len).ok_or(ParseError::InvalidField {
            field: "free_range",
            reason: "overflow",
        })?;
        if len == 0 || end > managed_len {
            return Err(ParseError::InvalidField {
                field: "free_range",
                reason: "empty or past managed length",
            });
        }
        if prev_end.is_some_and(|p| start <= p) {
            return Err(ParseError::InvalidField {
                field: "free_range",
                reason: "not ascending or not merged",
            });
        }
        map.free(start, len).map_err(|_| ParseError::InvalidField {
            field: "free_range",
            reason: "overlapping",
        })?;
        prev_end = Some(end);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ranges_in_order() {
        let mut map = FreeSpaceMap::with_free_range(2, 3);
        map.free(10, 6).unwrap();
        let bytes = encode_free_map(&map);
        assert_eq!(bytes.len(), encoded_len(2));
        assert_eq!(&bytes[16..24], &2_u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &6_u64.to_le_bytes());
        assert_eq!(decode_free_map(&bytes, 16).unwrap(), map);
    }

    #[test]
    fn empty_map_is_header_only() {
        let bytes = encode_free_map(&FreeSpaceMap::new());
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert!(decode_free_map(&bytes, 0).unwrap().is_empty());
    }

    #[test]
    fn range_past_managed_len_rejected() {
        let bytes = encode_free_map(&FreeSpaceMap::with_free_range(0, 10));
        assert!(decode_free_map(&bytes, 9).is_err());
    }

    #[test]
    fn adjacent_ranges_rejected() {
        let mut bytes = encode_free_map(&FreeSpaceMap::with_free_range(0, 2));
        bytes[8..16].copy_from_slice(&2_u64.to_le_bytes());
        bytes.extend_from_slice(&2_u64.to_le_bytes());
        bytes.extend_from_slice(&1_u64.to_le_bytes());
        assert!(matches!(
            decode_free_map(&bytes, 8),
            Err(ParseError::InvalidField { field: "free_range", .. })
        ));
    }

    #[test]
    fn truncated_and_bad_magic_rejected() {
        let bytes = encode_free_map(&FreeSpaceMap::with_free_range(0, 4));
        assert!(matches!(
            decode_free_map(&bytes[..20], 4),
            Err(ParseError::InsufficientData { .. })
        ));
        let mut bad = bytes;
        bad[0] ^= 0xFF;
        assert!(matches!(
            decode_free_map(&bad, 4),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}
