//! Column payload encoding: little-endian primitives, varints, delta timestamps and typed tag values.

use crate::error::PartError;
use crate::types::{ElementId, TagValue, Timestamp};

use crc32fast::Hasher as Crc32;
use std::io::{Cursor, Read};
use std::path::Path;

const TAG_TYPE_NULL: u8 = 0;
const TAG_TYPE_STR: u8 = 1;
const TAG_TYPE_INT64: u8 = 2;
const TAG_TYPE_BINARY: u8 = 3;
const TAG_TYPE_STR_ARRAY: u8 = 4;
const TAG_TYPE_INT64_ARRAY: u8 = 5;

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, PartError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, PartError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}
pub fn read_i64<R: Read>(r: &mut R) -> Result<i64, PartError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Number of bytes `write_var_u64` emits for `v`.
pub(crate) fn var_u64_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub(crate) fn read_var_u64<R: Read>(r: &mut R) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}

fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    write_var_u64(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

fn read_bytes<R: Read>(r: &mut R, limit: usize) -> Result<Vec<u8>, String> {
    let len = read_var_u64(r)? as usize;
    if len > limit {
        return Err(format!("Length {} exceeds remaining {}", len, limit));
    }
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)
        .map_err(|e| format!("Truncated payload: {}", e))?;
    Ok(b)
}

/// Encodes one block's timestamps (base + deltas) followed by its element ids.
///
/// Timestamps must be non-decreasing.
pub(crate) fn encode_timestamps(
    timestamps: &[Timestamp],
    element_ids: &[ElementId],
    out: &mut Vec<u8>,
) -> Result<(), PartError> {
    if timestamps.is_empty() {
        return Err(PartError::Internal(
            "Refusing to encode an empty timestamps block".to_string(),
        ));
    }
    if timestamps.len() != element_ids.len() {
        return Err(PartError::Internal(format!(
            "Timestamps/element ids length mismatch: {} vs {}",
            timestamps.len(),
            element_ids.len()
        )));
    }

    let base = timestamps[0];
    write_i64(out, base);
    let mut prev = base;
    for &ts in &timestamps[1..] {
        if ts < prev {
            return Err(PartError::Internal(
                "Rows must be sorted by timestamp for delta encoding".to_string(),
            ));
        }
        write_var_u64(out, ts.abs_diff(prev));
        prev = ts;
    }
    for &id in element_ids {
        write_u64(out, id);
    }
    Ok(())
}

pub(crate) fn decode_timestamps(
    bytes: &[u8],
    count: usize,
    path: &Path,
) -> Result<(Vec<Timestamp>, Vec<ElementId>), PartError> {
    if count == 0 {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut cur = Cursor::new(bytes);
    let base = read_i64(&mut cur)
        .map_err(|e| PartError::corruption(path, format!("Truncated timestamps: {}", e)))?;

    let mut timestamps = Vec::with_capacity(count);
    timestamps.push(base);
    let mut prev = base;
    for _ in 1..count {
        let d = read_var_u64(&mut cur).map_err(|e| PartError::corruption(path, e))?;
        let ts = prev
            .checked_add_unsigned(d)
            .ok_or_else(|| PartError::corruption(path, "Timestamp delta overflow"))?;
        timestamps.push(ts);
        prev = ts;
    }

    let mut element_ids = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_u64(&mut cur)
            .map_err(|e| PartError::corruption(path, format!("Truncated element ids: {}", e)))?;
        element_ids.push(id);
    }
    Ok((timestamps, element_ids))
}

/// Appends one typed value: type byte, varint length, payload.
pub(crate) fn encode_tag_value(value: &TagValue, out: &mut Vec<u8>) {
    match value {
        TagValue::Null => {
            out.push(TAG_TYPE_NULL);
            write_var_u64(out, 0);
        }
        TagValue::Str(s) => {
            out.push(TAG_TYPE_STR);
            write_bytes(out, s.as_bytes());
        }
        TagValue::Int64(v) => {
            out.push(TAG_TYPE_INT64);
            write_bytes(out, &v.to_le_bytes());
        }
        TagValue::Binary(b) => {
            out.push(TAG_TYPE_BINARY);
            write_bytes(out, b);
        }
        TagValue::StrArray(items) => {
            out.push(TAG_TYPE_STR_ARRAY);
            let mut payload = Vec::with_capacity(value.size());
            for s in items {
                write_bytes(&mut payload, s.as_bytes());
            }
            write_bytes(out, &payload);
        }
        TagValue::Int64Array(items) => {
            out.push(TAG_TYPE_INT64_ARRAY);
            let mut payload = Vec::with_capacity(items.len() * 8);
            for v in items {
                write_i64(&mut payload, *v);
            }
            write_bytes(out, &payload);
        }
    }
}

fn utf8(b: Vec<u8>) -> Result<String, String> {
    String::from_utf8(b).map_err(|e| format!("Invalid UTF-8: {}", e))
}

fn decode_tag_value<R: Read>(r: &mut R, limit: usize) -> Result<TagValue, String> {
    let mut t = [0u8; 1];
    r.read_exact(&mut t)
        .map_err(|e| format!("Truncated tag value: {}", e))?;
    let payload = read_bytes(r, limit)?;
    match t[0] {
        TAG_TYPE_NULL => Ok(TagValue::Null),
        TAG_TYPE_STR => Ok(TagValue::Str(utf8(payload)?)),
        TAG_TYPE_INT64 => {
            let b: [u8; 8] = payload
                .as_slice()
                .try_into()
                .map_err(|_| format!("Bad int64 payload length {}", payload.len()))?;
            Ok(TagValue::Int64(i64::from_le_bytes(b)))
        }
        TAG_TYPE_BINARY => Ok(TagValue::Binary(payload)),
        TAG_TYPE_STR_ARRAY => {
            let len = payload.len();
            let mut cur = Cursor::new(payload);
            let mut items = Vec::new();
            while (cur.position() as usize) < len {
                items.push(utf8(read_bytes(&mut cur, len)?)?);
            }
            Ok(TagValue::StrArray(items))
        }
        TAG_TYPE_INT64_ARRAY => {
            if payload.len() % 8 != 0 {
                return Err(format!("Bad int64 array payload length {}", payload.len()));
            }
            Ok(TagValue::Int64Array(
                payload
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        i64::from_le_bytes(b)
                    })
                    .collect(),
            ))
        }
        other => Err(format!("Unknown tag value type {}", other)),
    }
}

/// Decodes exactly `count` values written by [`encode_tag_value`].
pub(crate) fn decode_tag_values(
    bytes: &[u8],
    count: usize,
    path: &Path,
) -> Result<Vec<TagValue>, PartError> {
    let mut cur = Cursor::new(bytes);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let v = decode_tag_value(&mut cur, bytes.len()).map_err(|e| PartError::corruption(path, e))?;
        out.push(v);
    }
    if cur.position() as usize != bytes.len() {
        return Err(PartError::corruption(
            path,
            format!(
                "Trailing bytes in tag column: {} of {}",
                bytes.len() - cur.position() as usize,
                bytes.len()
            ),
        ));
    }
    Ok(out)
}
