//! Splitting a file byte range into fetchable chunks
//!
//! A chunk never crosses a unit boundary or an encoded blob boundary, and is
//! never larger than one blob. Providers can then serve each chunk from a
//! single blob and a single peer response stays far below the wire cap.

use crate::ids::ValidationError;
use crate::unit::{BLOB_SIZE, SCALAR_BYTES, SCALAR_PAYLOAD_BYTES, UNIT_CAPACITY};

/// A sub-range relative to the start of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeChunk {
    pub range_start: u64,
    pub range_len: u64,
}

/// Position of raw byte `raw` (offset within a unit) in the encoded unit.
fn encoded_pos(raw: usize) -> usize {
    raw + raw / SCALAR_PAYLOAD_BYTES + 1
}

/// Encoded blob holding raw byte `raw` of a unit.
pub fn blob_index(raw: usize) -> usize {
    encoded_pos(raw) / BLOB_SIZE
}

/// Smallest raw offset whose encoded position is at least `target`.
fn first_raw_at(target: usize) -> usize {
    let t = target.saturating_sub(1);
    let (q, s) = (t / SCALAR_BYTES, t % SCALAR_BYTES);
    if s < SCALAR_PAYLOAD_BYTES {
        q * SCALAR_PAYLOAD_BYTES + s
    } else {
        (q + 1) * SCALAR_PAYLOAD_BYTES
    }
}

fn next_blob_boundary(raw: usize) -> usize {
    first_raw_at((blob_index(raw) + 1) * BLOB_SIZE).min(UNIT_CAPACITY)
}

/// Plan `[range_start, range_start + range_len)` of a file stored at
/// `file_start_offset` in the slab's user data. The range is clamped to the
/// end of the file.
pub fn plan_range_chunks(
    file_start_offset: u64,
    file_size: u64,
    range_start: u64,
    range_len: u64,
) -> Result<Vec<RangeChunk>, ValidationError> {
    if file_size == 0 {
        return Err(ValidationError::InvalidRange("file size must be > 0".into()));
    }
    if range_len == 0 {
        return Err(ValidationError::InvalidRange("range length must be > 0".into()));
    }
    if range_start >= file_size {
        return Err(ValidationError::InvalidRange(format!(
            "range start {} beyond end of file ({} bytes)",
            range_start, file_size
        )));
    }

    let capacity = UNIT_CAPACITY as u64;
    let mut remaining = range_len.min(file_size - range_start);
    let mut cursor = range_start;
    let mut chunks = Vec::new();

    while remaining > 0 {
        let offset_in_unit = ((file_start_offset + cursor) % capacity) as usize;
        let unit_remaining = (UNIT_CAPACITY - offset_in_unit) as u64;
        let blob_remaining = (next_blob_boundary(offset_in_unit) - offset_in_unit) as u64;
        let len = remaining
            .min(unit_remaining)
            .min(blob_remaining)
            .min(BLOB_SIZE as u64);

        chunks.push(RangeChunk {
            range_start: cursor,
            range_len: len,
        });
        cursor += len;
        remaining -= len;
    }

    Ok(chunks)
}
