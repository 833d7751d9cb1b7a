//! Encoding unit layout
//!
//! A unit is a fixed 8 MiB buffer viewed as 32-byte scalar slots. Each slot
//! carries at most 31 payload bytes, right-aligned so the leading byte of a
//! full slot is always zero.

use thiserror::Error;

/// Size of one encoding unit in bytes (8 MiB)
pub const UNIT_SIZE: usize = 8 * 1024 * 1024;

/// Size of one blob, the granularity of a single commitment (128 KiB)
pub const BLOB_SIZE: usize = 128 * 1024;

/// Number of blobs per unit
pub const BLOBS_PER_UNIT: usize = UNIT_SIZE / BLOB_SIZE;

/// Width of one scalar slot
pub const SCALAR_BYTES: usize = 32;

/// Payload bytes carried by one scalar slot
pub const SCALAR_PAYLOAD_BYTES: usize = 31;

/// Number of scalar slots per unit
pub const SCALARS_PER_UNIT: usize = UNIT_SIZE / SCALAR_BYTES;

/// Raw payload bytes that fit into one unit (8,126,464)
pub const UNIT_CAPACITY: usize = SCALARS_PER_UNIT * SCALAR_PAYLOAD_BYTES;

/// Size of a single blob commitment
pub const COMMITMENT_BYTES: usize = 48;

/// Flattened witness size for one unit (64 commitments)
pub const WITNESS_BYTES_PER_UNIT: usize = BLOBS_PER_UNIT * COMMITMENT_BYTES;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unit must be {expected} bytes, got {actual}")]
    WrongUnitSize { expected: usize, actual: usize },

    #[error("payload of {len} bytes exceeds unit capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("range {start}+{len} is outside valid length {valid_len}")]
    RangeOutOfBounds {
        start: usize,
        len: usize,
        valid_len: usize,
    },

    #[error("root table is full (slot {0})")]
    RootTableFull(usize),

    #[error("file table is full ({0} records)")]
    FileTableFull(usize),

    #[error("file table magic mismatch")]
    BadMagic,

    #[error("unsupported file table layout: {0}")]
    UnsupportedLayout(String),

    #[error("witness stream produced {actual} units, expected {expected}")]
    WitnessCountMismatch { expected: usize, actual: usize },
}

/// Pack raw bytes into a zero-filled unit.
///
/// Bytes beyond [`UNIT_CAPACITY`] are ignored; callers chunk beforehand.
pub fn encode(raw: &[u8]) -> Vec<u8> {
    let mut unit = vec![0u8; UNIT_SIZE];
    let raw = &raw[..raw.len().min(UNIT_CAPACITY)];

    for (slot, stride) in raw.chunks(SCALAR_PAYLOAD_BYTES).enumerate() {
        let offset = slot * SCALAR_BYTES + (SCALAR_BYTES - stride.len());
        unit[offset..offset + stride.len()].copy_from_slice(stride);
    }

    unit
}

/// Recover the first `valid_len` raw bytes from an encoded unit.
pub fn decode(unit: &[u8], valid_len: usize) -> Result<Vec<u8>, EncodingError> {
    decode_range(unit, 0, valid_len, valid_len)
}

/// Recover raw bytes `[raw_start, raw_start + raw_len)` from an encoded unit
/// whose total raw payload was `valid_len` bytes.
///
/// `valid_len` is needed because the last partial stride is right-aligned in
/// its slot, so its payload position depends on the stride length.
pub fn decode_range(
    unit: &[u8],
    raw_start: usize,
    raw_len: usize,
    valid_len: usize,
) -> Result<Vec<u8>, EncodingError> {
    if unit.len() != UNIT_SIZE {
        return Err(EncodingError::WrongUnitSize {
            expected: UNIT_SIZE,
            actual: unit.len(),
        });
    }
    if valid_len > UNIT_CAPACITY {
        return Err(EncodingError::PayloadTooLarge {
            len: valid_len,
            capacity: UNIT_CAPACITY,
        });
    }
    let end = raw_start
        .checked_add(raw_len)
        .filter(|end| *end <= valid_len)
        .ok_or(EncodingError::RangeOutOfBounds {
            start: raw_start,
            len: raw_len,
            valid_len,
        })?;

    let full_slots = valid_len / SCALAR_PAYLOAD_BYTES;
    let tail_len = valid_len % SCALAR_PAYLOAD_BYTES;

    let mut out = Vec::with_capacity(raw_len);
    let mut cursor = raw_start;
    while cursor < end {
        let slot = cursor / SCALAR_PAYLOAD_BYTES;
        let within = cursor % SCALAR_PAYLOAD_BYTES;
        let stride_len = if tail_len != 0 && slot == full_slots {
            tail_len
        } else {
            SCALAR_PAYLOAD_BYTES
        };
        let payload_start = slot * SCALAR_BYTES + (SCALAR_BYTES - stride_len);
        let take = (stride_len - within).min(end - cursor);

        out.extend_from_slice(&unit[payload_start + within..payload_start + within + take]);
        cursor += take;
    }

    Ok(out)
}

/// Number of units needed to hold `len` raw bytes.
pub fn units_for(len: u64) -> u64 {
    len.div_ceil(UNIT_CAPACITY as u64)
}
