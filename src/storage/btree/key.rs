//! Order-preserving key encoding.
//!
//! Every B+ tree key is a byte string compared with plain `memcmp`. Table
//! keys are the big-endian row id. Index keys concatenate per-column
//! encodings chosen so that byte order equals the column kind's natural
//! order, followed by the big-endian row id as a tie-break under
//! duplicates:
//!
//! - NULL is a single `0x00` tag and sorts before every value.
//! - Non-NULL values carry a `0x01` tag, then:
//!   integers and timestamps are sign-flipped big-endian; floats use the
//!   IEEE-754 total-order transform; text is escaped (`0x00` becomes
//!   `0x00 0xFF`) and terminated with `0x00 0x00`.

use crate::error::{Error, Result};
use crate::types::{DataType, RowId, Value};

/// Tag byte for a NULL key column.
const TAG_NULL: u8 = 0x00;
/// Tag byte for a present key column.
const TAG_VALUE: u8 = 0x01;

/// Encoded width of the row-id tie-break suffix.
pub const ROW_ID_SUFFIX: usize = 8;

/// Encode a table (clustered) key.
pub fn encode_row_id(row_id: RowId) -> Vec<u8> {
    row_id.to_be_bytes().to_vec()
}

/// Decode a table key back to its row id.
pub fn decode_row_id(key: &[u8]) -> Result<RowId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::corrupt("table key is not 8 bytes"))?;
    Ok(RowId::from_be_bytes(bytes))
}

/// Encode the column part of an index key (everything before the row id).
/// `values` must already be coerced to `kinds`.
pub fn encode_index_prefix(kinds: &[DataType], values: &[Value]) -> Result<Vec<u8>> {
    debug_assert_eq!(kinds.len(), values.len());
    let mut out = Vec::with_capacity(16);
    for (kind, value) in kinds.iter().zip(values) {
        encode_column(*kind, value, &mut out)?;
    }
    Ok(out)
}

/// Encode a full index key: column encodings plus the row-id tie-break.
pub fn encode_index_key(kinds: &[DataType], values: &[Value], row_id: RowId) -> Result<Vec<u8>> {
    let mut out = encode_index_prefix(kinds, values)?;
    out.extend_from_slice(&row_id.to_be_bytes());
    Ok(out)
}

/// The column part of a stored index key (strips the row-id suffix).
pub fn index_key_prefix(key: &[u8]) -> &[u8] {
    &key[..key.len().saturating_sub(ROW_ID_SUFFIX)]
}

/// The row id carried in a stored index key.
pub fn index_key_row_id(key: &[u8]) -> Result<RowId> {
    if key.len() < ROW_ID_SUFFIX {
        return Err(Error::corrupt("index key too short for row id"));
    }
    let bytes: [u8; 8] = key[key.len() - ROW_ID_SUFFIX..].try_into().unwrap();
    Ok(RowId::from_be_bytes(bytes))
}

/// Smallest byte string greater than every string that starts with `prefix`,
/// or `None` when `prefix` is all `0xFF`. Used for exclusive scan bounds.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

/// Worst-case encoded width of one key column, used to size internal-node
/// fan-out.
pub fn max_column_width(kind: DataType) -> usize {
    match kind {
        DataType::Boolean => 2,
        DataType::Int4 | DataType::Real => 5,
        DataType::Int8 | DataType::Double | DataType::Timestamp => 9,
        // Every 0x00 may escape to two bytes, plus tag and terminator.
        DataType::Varchar(n) => 1 + 2 * n as usize + 2,
        DataType::Text => 1 + 2 * 255 + 2,
    }
}

/// Worst-case encoded width of a full index key over `kinds`.
pub fn max_key_width(kinds: &[DataType]) -> usize {
    kinds.iter().map(|k| max_column_width(*k)).sum::<usize>() + ROW_ID_SUFFIX
}

fn encode_column(kind: DataType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    if value.is_null() {
        out.push(TAG_NULL);
        return Ok(());
    }
    out.push(TAG_VALUE);
    match (kind, value) {
        (DataType::Boolean, Value::Boolean(b)) => out.push(*b as u8),
        (DataType::Int4, Value::Int4(v)) => {
            out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
        }
        (DataType::Int8, Value::Int8(v)) | (DataType::Timestamp, Value::Timestamp(v)) => {
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes())
        }
        (DataType::Real, Value::Real(v)) => {
            let bits = v.to_bits();
            let ordered = if bits & 0x8000_0000 != 0 {
                !bits
            } else {
                bits | 0x8000_0000
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        (DataType::Double, Value::Double(v)) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) != 0 {
                !bits
            } else {
                bits | (1 << 63)
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        (DataType::Varchar(_) | DataType::Text, Value::Text(s)) => {
            for &b in s.as_bytes() {
                if b == 0x00 {
                    out.extend_from_slice(&[0x00, 0xFF]);
                } else {
                    out.push(b);
                }
            }
            out.extend_from_slice(&[0x00, 0x00]);
        }
        (kind, value) => {
            return Err(Error::TypeMismatch(format!(
                "cannot build {} index key from {}",
                kind,
                value.kind_name()
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(kind: DataType, value: Value) -> Vec<u8> {
        encode_index_prefix(&[kind], &[value]).unwrap()
    }

    #[test]
    fn test_row_id_order_and_round_trip() {
        let a = encode_row_id(1);
        let b = encode_row_id(2);
        let c = encode_row_id(u64::MAX);
        assert!(a < b && b < c);
        assert_eq!(decode_row_id(&c).unwrap(), u64::MAX);
    }

    #[test]
    fn test_integer_order() {
        let values = [i64::MIN, -5, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| enc(DataType::Int8, Value::Int8(*v)))
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_float_order() {
        let values = [f64::NEG_INFINITY, -1.5, -0.0, 0.0, 0.25, 7.0, f64::INFINITY];
        let encoded: Vec<_> = values
            .iter()
            .map(|v| enc(DataType::Double, Value::Double(*v)))
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} !<= {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_text_order_with_embedded_nul() {
        let a = enc(DataType::Text, Value::Text("abc".into()));
        let b = enc(DataType::Text, Value::Text("abc\0".into()));
        let c = enc(DataType::Text, Value::Text("abcd".into()));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_null_sorts_first() {
        let null = enc(DataType::Int8, Value::Null);
        let min = enc(DataType::Int8, Value::Int8(i64::MIN));
        assert!(null < min);
    }

    #[test]
    fn test_composite_with_row_id_tie_break() {
        let kinds = [DataType::Varchar(10)];
        let k1 = encode_index_key(&kinds, &[Value::Text("dup".into())], 1).unwrap();
        let k2 = encode_index_key(&kinds, &[Value::Text("dup".into())], 2).unwrap();
        assert!(k1 < k2);
        assert_eq!(index_key_prefix(&k1), index_key_prefix(&k2));
        assert_eq!(index_key_row_id(&k2).unwrap(), 2);
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab").unwrap(), b"ac".to_vec());
        assert_eq!(prefix_successor(&[0x01, 0xFF]).unwrap(), vec![0x02]);
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_timestamp_orders_as_integer() {
        let early = enc(DataType::Timestamp, Value::Timestamp(-1_000_000));
        let epoch = enc(DataType::Timestamp, Value::Timestamp(0));
        let later = enc(DataType::Timestamp, Value::Timestamp(1_000_000));
        assert!(early < epoch && epoch < later);
    }
}
