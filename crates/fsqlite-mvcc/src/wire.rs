//! Byte-exact on-disk formats: VarInt, `VersionedCell`, and the bulk
//! fast/slow-path array encoding.
//!
//! These live apart from the generic in-memory [`VersionedCell`] so
//! persistence concerns (caller-supplied key/value codecs, byte layout)
//! don't leak into the hot read/write path. A [`ValueCodec`] is the
//! caller-supplied per-type serializer a real on-disk substrate would need.

use fsqlite_error::{FrankenError, Result};

use crate::versioned_value::VersionedCell;

/// Encodes/decodes a single value to/from bytes. Implemented for
/// `Vec<u8>` (identity) as the default for tests; real callers supply
/// one per stored type, mirroring the substrate's data-type contract.
pub trait ValueCodec<V> {
    /// Append the encoded form of `value` to `buf`.
    fn encode(&self, value: &V, buf: &mut Vec<u8>);
    /// Decode a value starting at `buf[0..]`, returning it and the
    /// number of bytes consumed.
    fn decode(&self, buf: &[u8]) -> Result<(V, usize)>;
}

/// Identity codec for raw bytes, length-prefixed with a VarInt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteVecCodec;

impl ValueCodec<Vec<u8>> for ByteVecCodec {
    fn encode(&self, value: &Vec<u8>, buf: &mut Vec<u8>) {
        write_varint(buf, value.len() as u64);
        buf.extend_from_slice(value);
    }

    fn decode(&self, buf: &[u8]) -> Result<(Vec<u8>, usize)> {
        let (len, n) = read_varint(buf)?;
        let len = len as usize;
        let total = n + len;
        if buf.len() < total {
            return Err(FrankenError::Serialization("truncated byte vec".into()));
        }
        Ok((buf[n..total].to_vec(), total))
    }
}

/// Write an unsigned LEB128 VarInt.
pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 VarInt, returning the value and bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(FrankenError::Serialization("varint too long".into()));
        }
    }
    Err(FrankenError::Serialization("truncated varint".into()))
}

/// Zigzag-encode a signed integer so small negative numbers (notably
/// `mapId = -1` for `COMMIT_MARKER`) stay short as a VarInt.
#[must_use]
pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
#[must_use]
pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn write_svarint(buf: &mut Vec<u8>, v: i64) {
    write_varint(buf, zigzag_encode(v));
}

pub fn read_svarint(buf: &[u8]) -> Result<(i64, usize)> {
    let (u, n) = read_varint(buf)?;
    Ok((zigzag_decode(u), n))
}

/// Serialize a [`VersionedCell`]:
/// `VarLong opId; if opId == 0 { value } else { flags byte; current?; committed? }`.
pub fn write_versioned_cell<V>(buf: &mut Vec<u8>, cell: &VersionedCell<V>, codec: &dyn ValueCodec<V>) {
    write_varint(buf, cell.op_id);
    if cell.op_id == 0 {
        // Committed cells always carry a value (a committed null is
        // never stored; the cell would be absent instead).
        let v = cell.current.as_ref().expect("committed cell must carry a value");
        codec.encode(v, buf);
    } else {
        let mut flags = 0u8;
        if cell.current.is_some() {
            flags |= 0b01;
        }
        if cell.committed.is_some() {
            flags |= 0b10;
        }
        buf.push(flags);
        if let Some(v) = &cell.current {
            codec.encode(v, buf);
        }
        if let Some(v) = &cell.committed {
            codec.encode(v, buf);
        }
    }
}

/// Inverse of [`write_versioned_cell`].
pub fn read_versioned_cell<V>(buf: &[u8], codec: &dyn ValueCodec<V>) -> Result<(VersionedCell<V>, usize)> {
    let (op_id, mut pos) = read_varint(buf)?;
    if op_id == 0 {
        let (v, n) = codec.decode(&buf[pos..])?;
        pos += n;
        Ok((VersionedCell { op_id: 0, current: Some(v), committed: None }, pos))
    } else {
        let flags = *buf.get(pos).ok_or_else(|| FrankenError::Serialization("truncated cell flags".into()))?;
        pos += 1;
        let current = if flags & 0b01 != 0 {
            let (v, n) = codec.decode(&buf[pos..])?;
            pos += n;
            Some(v)
        } else {
            None
        };
        let committed = if flags & 0b10 != 0 {
            let (v, n) = codec.decode(&buf[pos..])?;
            pos += n;
            Some(v)
        } else {
            None
        };
        Ok((VersionedCell { op_id, current, committed }, pos))
    }
}

/// Bulk array encoding: one leading byte selects fast path (`0`, all
/// cells committed with a non-null value, serialized consecutively) or
/// slow path (`1`, each cell prefixed as in [`write_versioned_cell`]).
pub fn write_versioned_cell_array<V>(buf: &mut Vec<u8>, cells: &[VersionedCell<V>], codec: &dyn ValueCodec<V>) {
    let fast_path = cells.iter().all(|c| c.op_id == 0 && c.current.is_some());
    if fast_path {
        buf.push(0);
        for cell in cells {
            codec.encode(cell.current.as_ref().expect("fast path guarantees Some"), buf);
        }
    } else {
        buf.push(1);
        for cell in cells {
            write_versioned_cell(buf, cell, codec);
        }
    }
}

/// Inverse of [`write_versioned_cell_array`]. `count` must be known by
/// the caller (it is not itself encoded, matching the array's use as a
/// page-local column of already-length-known cells).
pub fn read_versioned_cell_array<V>(
    buf: &[u8],
    count: usize,
    codec: &dyn ValueCodec<V>,
) -> Result<(Vec<VersionedCell<V>>, usize)> {
    let tag = *buf.first().ok_or_else(|| FrankenError::Serialization("empty cell array".into()))?;
    let mut pos = 1;
    let mut out = Vec::with_capacity(count);
    match tag {
        0 => {
            for _ in 0..count {
                let (v, n) = codec.decode(&buf[pos..])?;
                pos += n;
                out.push(VersionedCell::committed(v));
            }
        }
        1 => {
            for _ in 0..count {
                let (cell, n) = read_versioned_cell(&buf[pos..], codec)?;
                pos += n;
                out.push(cell);
            }
        }
        other => return Err(FrankenError::Serialization(format!("unknown cell array tag {other}"))),
    }
    Ok((out, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let (decoded, n) = read_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn svarint_roundtrip_including_negative_one() {
        for v in [-1i64, 0, 1, -1000, 1000, i64::MIN + 1] {
            let mut buf = Vec::new();
            write_svarint(&mut buf, v);
            let (decoded, n) = read_svarint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn versioned_cell_committed_roundtrip() {
        let codec = ByteVecCodec;
        let cell = VersionedCell::committed(b"hello".to_vec());
        let mut buf = Vec::new();
        write_versioned_cell(&mut buf, &cell, &codec);
        let (decoded, n) = read_versioned_cell(&buf, &codec).unwrap();
        assert_eq!(decoded, cell);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn versioned_cell_uncommitted_roundtrip_both_present() {
        let codec = ByteVecCodec;
        let cell = VersionedCell::uncommitted(
            crate::opid::make_op_id(7, 3),
            Some(b"new".to_vec()),
            Some(b"old".to_vec()),
        );
        let mut buf = Vec::new();
        write_versioned_cell(&mut buf, &cell, &codec);
        let (decoded, _) = read_versioned_cell(&buf, &codec).unwrap();
        assert_eq!(decoded, cell);
    }

    #[test]
    fn versioned_cell_uncommitted_delete_roundtrip() {
        let codec = ByteVecCodec;
        let cell: VersionedCell<Vec<u8>> =
            VersionedCell::uncommitted(crate::opid::make_op_id(7, 3), None, Some(b"old".to_vec()));
        let mut buf = Vec::new();
        write_versioned_cell(&mut buf, &cell, &codec);
        let (decoded, _) = read_versioned_cell(&buf, &codec).unwrap();
        assert_eq!(decoded, cell);
    }

    #[test]
    fn bulk_array_fast_path_for_all_committed() {
        let codec = ByteVecCodec;
        let cells: Vec<VersionedCell<Vec<u8>>> =
            (0..5).map(|i| VersionedCell::committed(vec![i])).collect();
        let mut buf = Vec::new();
        write_versioned_cell_array(&mut buf, &cells, &codec);
        assert_eq!(buf[0], 0, "all-committed array should take the fast path");
        let (decoded, _) = read_versioned_cell_array(&buf, cells.len(), &codec).unwrap();
        assert_eq!(decoded, cells);
    }

    #[test]
    fn bulk_array_slow_path_when_any_uncommitted() {
        let codec = ByteVecCodec;
        let mut cells: Vec<VersionedCell<Vec<u8>>> =
            (0..3).map(|i| VersionedCell::committed(vec![i])).collect();
        cells.push(VersionedCell::uncommitted(crate::opid::make_op_id(2, 0), Some(vec![9]), None));
        let mut buf = Vec::new();
        write_versioned_cell_array(&mut buf, &cells, &codec);
        assert_eq!(buf[0], 1);
        let (decoded, _) = read_versioned_cell_array(&buf, cells.len(), &codec).unwrap();
        assert_eq!(decoded, cells);
    }

    proptest::proptest! {
        #[test]
        fn varint_roundtrip_any_u64(v: u64) {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let (decoded, n) = read_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }
}
