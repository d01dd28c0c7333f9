//! Row codec.
//!
//! A serialized row is a 64-bit NULL bitmap (bit `i` set means column `i`
//! is NULL) followed by the width-specific encodings of every non-NULL
//! column in declaration order. Text at or under [`INLINE_TEXT_MAX`] bytes
//! is stored inline as a varint length plus bytes; longer text is stored as
//! a pointer cell (total length, first overflow page, inline prefix) with
//! the remainder in a linked chain of overflow pages.

use crate::error::{Error, Result};
use crate::storage::btree::encoding::{
    read_u16, read_u32, read_u64, read_varint, write_u16, write_u32, write_varint,
};
use crate::storage::page::{OverflowPage, Page, OVERFLOW_CAPACITY};
use crate::storage::PageStore;
use crate::types::{DataType, PageId, TextRef, Value};

/// Hard cap on columns per table, the width of the NULL bitmap.
pub const MAX_COLUMNS: usize = 64;

/// Longest text value stored inline.
pub const INLINE_TEXT_MAX: usize = 255;

/// Inline prefix bytes kept in a long-text pointer.
pub const TEXT_PREFIX_LEN: usize = 64;

// ============================================================================
// Row Encoding
// ============================================================================

/// Serialise one row. `values` must already be coerced to the column kinds
/// and long text converted to [`TextRef`] pointers.
pub fn encode_row(kinds: &[DataType], values: &[Value]) -> Result<Vec<u8>> {
    if kinds.len() != values.len() {
        return Err(Error::corrupt("row arity does not match schema"));
    }
    if kinds.len() > MAX_COLUMNS {
        return Err(Error::corrupt("too many columns for null bitmap"));
    }

    let mut bitmap: u64 = 0;
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            bitmap |= 1 << i;
        }
    }

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&bitmap.to_le_bytes());
    for (kind, value) in kinds.iter().zip(values) {
        if !value.is_null() {
            encode_value(*kind, value, &mut out)?;
        }
    }
    Ok(out)
}

fn encode_value(kind: DataType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match (kind, value) {
        (DataType::Boolean, Value::Boolean(b)) => out.push(*b as u8),
        (DataType::Int4, Value::Int4(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DataType::Int8, Value::Int8(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DataType::Real, Value::Real(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DataType::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DataType::Timestamp, Value::Timestamp(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (DataType::Varchar(_) | DataType::Text, Value::Text(s)) => {
            if s.len() > INLINE_TEXT_MAX {
                return Err(Error::corrupt("text value exceeds inline capacity"));
            }
            write_varint(s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        (DataType::Text, Value::TextRef(r)) => {
            if r.len as usize <= INLINE_TEXT_MAX {
                return Err(Error::corrupt("short text stored as overflow pointer"));
            }
            write_varint(r.len, out);
            let mut fixed = [0u8; 6];
            write_u32(&mut fixed, 0, r.first_page);
            write_u16(&mut fixed, 4, r.prefix.len() as u16);
            out.extend_from_slice(&fixed);
            out.extend_from_slice(&r.prefix);
        }
        (kind, value) => {
            return Err(Error::TypeMismatch(format!(
                "cannot encode {} into {} column",
                value.kind_name(),
                kind
            )))
        }
    }
    Ok(())
}

/// Deserialise one row previously produced by [`encode_row`].
pub fn decode_row(kinds: &[DataType], data: &[u8]) -> Result<Vec<Value>> {
    if kinds.len() > MAX_COLUMNS {
        return Err(Error::corrupt("too many columns for null bitmap"));
    }
    let bitmap = read_u64(data, 0)?;
    let mut pos = 8usize;
    let mut values = Vec::with_capacity(kinds.len());

    for (i, kind) in kinds.iter().enumerate() {
        if bitmap & (1 << i) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = match kind {
            DataType::Boolean => {
                let b = *data
                    .get(pos)
                    .ok_or_else(|| Error::corrupt("row ends inside BOOLEAN"))?;
                pos += 1;
                Value::Boolean(b != 0)
            }
            DataType::Int4 => {
                let v = read_u32(data, pos)? as i32;
                pos += 4;
                Value::Int4(v)
            }
            DataType::Int8 => {
                let v = read_u64(data, pos)? as i64;
                pos += 8;
                Value::Int8(v)
            }
            DataType::Real => {
                let v = f32::from_le_bytes(
                    data.get(pos..pos + 4)
                        .ok_or_else(|| Error::corrupt("row ends inside REAL"))?
                        .try_into()
                        .unwrap(),
                );
                pos += 4;
                Value::Real(v)
            }
            DataType::Double => {
                let v = f64::from_le_bytes(
                    data.get(pos..pos + 8)
                        .ok_or_else(|| Error::corrupt("row ends inside DOUBLE"))?
                        .try_into()
                        .unwrap(),
                );
                pos += 8;
                Value::Double(v)
            }
            DataType::Timestamp => {
                let v = read_u64(data, pos)? as i64;
                pos += 8;
                Value::Timestamp(v)
            }
            DataType::Varchar(_) | DataType::Text => {
                let (len, consumed) = read_varint(data, pos)?;
                pos += consumed;
                if len as usize <= INLINE_TEXT_MAX {
                    let bytes = data
                        .get(pos..pos + len as usize)
                        .ok_or_else(|| Error::corrupt("row ends inside text"))?;
                    pos += len as usize;
                    Value::Text(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|_| Error::corrupt("text is not valid UTF-8"))?,
                    )
                } else {
                    let first_page = read_u32(data, pos)?;
                    let prefix_len = read_u16(data, pos + 4)? as usize;
                    pos += 6;
                    let prefix = data
                        .get(pos..pos + prefix_len)
                        .ok_or_else(|| Error::corrupt("row ends inside text prefix"))?
                        .to_vec();
                    pos += prefix_len;
                    Value::TextRef(TextRef {
                        len,
                        first_page,
                        prefix,
                    })
                }
            }
        };
        values.push(value);
    }
    Ok(values)
}

// ============================================================================
// Overflow Chains
// ============================================================================

/// Spill a long text value into an overflow chain, returning the pointer to
/// store inline. Pages are allocated tail-first so each segment can link to
/// its successor.
pub fn store_long_text<S: PageStore>(store: &mut S, text: &str) -> Result<TextRef> {
    let bytes = text.as_bytes();
    debug_assert!(bytes.len() > INLINE_TEXT_MAX);
    let prefix_len = TEXT_PREFIX_LEN.min(bytes.len());
    let tail = &bytes[prefix_len..];

    let mut next: PageId = 0;
    for chunk in tail.chunks(OVERFLOW_CAPACITY).rev() {
        next = store.alloc_page(Page::Overflow(OverflowPage {
            next,
            version: 1,
            data: chunk.to_vec(),
        }))?;
    }

    Ok(TextRef {
        len: bytes.len() as u64,
        first_page: next,
        prefix: bytes[..prefix_len].to_vec(),
    })
}

/// Materialise the full text behind a pointer by walking its chain.
pub fn resolve_text<S: PageStore>(store: &mut S, r: &TextRef) -> Result<String> {
    let mut bytes = Vec::with_capacity(r.len as usize);
    bytes.extend_from_slice(&r.prefix);
    let mut next = r.first_page;
    while next != 0 {
        store.cancel().check()?;
        let page = store.page(next)?;
        let segment = page.overflow()?;
        bytes.extend_from_slice(&segment.data);
        next = segment.next;
    }
    if bytes.len() as u64 != r.len {
        return Err(Error::corrupt("overflow chain length mismatch"));
    }
    String::from_utf8(bytes).map_err(|_| Error::corrupt("text is not valid UTF-8"))
}

/// Free every page of an overflow chain.
pub fn free_overflow<S: PageStore>(store: &mut S, first_page: PageId) -> Result<()> {
    let mut next = first_page;
    while next != 0 {
        let page = store.page(next)?;
        let succ = page.overflow()?.next;
        store.free_page(next)?;
        next = succ;
    }
    Ok(())
}

/// Free the overflow chains owned by a row's values.
pub fn free_row_overflows<S: PageStore>(store: &mut S, values: &[Value]) -> Result<()> {
    for value in values {
        if let Value::TextRef(r) = value {
            free_overflow(store, r.first_page)?;
        }
    }
    Ok(())
}
