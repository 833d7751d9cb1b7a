//! Metadata unit layout (unit index 0 of every slab)
//!
//! ```text
//! [0, 16 * BLOB)            root table, 32-byte slot per witness/user root
//! [16 * BLOB, 16 * BLOB+128) file table header
//! [16 * BLOB + 128, 64 * BLOB) fixed-size file records
//! ```
//!
//! The metadata unit is stored raw (not scalar-encoded) so providers can
//! read the file table directly.

use crate::ids::ValidationError;
use crate::unit::{EncodingError, BLOB_SIZE, UNIT_SIZE};

pub const ROOT_SIZE: usize = 32;
pub const ROOT_TABLE_END: usize = 16 * BLOB_SIZE;
pub const MAX_ROOTS: usize = ROOT_TABLE_END / ROOT_SIZE;

pub const FILE_TABLE_START: usize = 16 * BLOB_SIZE;
pub const FILE_TABLE_END: usize = 64 * BLOB_SIZE;
pub const FILE_TABLE_HEADER_SIZE: usize = 128;
pub const FILE_RECORD_SIZE: usize = 64;
pub const MAX_PATH_BYTES: usize = 40;
pub const MAX_FILE_RECORDS: usize =
    (FILE_TABLE_END - FILE_TABLE_START - FILE_TABLE_HEADER_SIZE) / FILE_RECORD_SIZE;

pub const FILE_TABLE_MAGIC: [u8; 4] = *b"NILF";
pub const FILE_TABLE_VERSION: u8 = 1;

const LENGTH_MASK: u64 = (1 << 56) - 1;

/// One entry in the file table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub start_offset: u64,
    pub flags: u8,
    pub timestamp: u64,
}

impl FileRecord {
    pub fn new(path: &str, size: u64, start_offset: u64) -> Result<Self, ValidationError> {
        if path.is_empty()
            || path.len() > MAX_PATH_BYTES
            || path.contains(['/', '\\', '\0'])
        {
            return Err(ValidationError::InvalidPath(path.to_string()));
        }
        if size > LENGTH_MASK {
            return Err(ValidationError::InvalidRange(format!(
                "file size {} exceeds 56-bit length field",
                size
            )));
        }
        Ok(Self {
            path: path.to_string(),
            size,
            start_offset,
            flags: 0,
            timestamp: 0,
        })
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.size
    }

    fn to_bytes(&self) -> [u8; FILE_RECORD_SIZE] {
        let mut out = [0u8; FILE_RECORD_SIZE];
        let length_and_flags = (self.size & LENGTH_MASK) | ((self.flags as u64) << 56);
        out[0..8].copy_from_slice(&self.start_offset.to_le_bytes());
        out[8..16].copy_from_slice(&length_and_flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out[24..24 + self.path.len()].copy_from_slice(self.path.as_bytes());
        out
    }

    /// Returns `None` for tombstoned (empty path) records.
    fn from_bytes(raw: &[u8]) -> Option<Self> {
        let path_bytes = &raw[24..24 + MAX_PATH_BYTES];
        let path_len = path_bytes.iter().position(|b| *b == 0).unwrap_or(MAX_PATH_BYTES);
        if path_len == 0 {
            return None;
        }
        let start_offset = u64::from_le_bytes(raw[0..8].try_into().ok()?);
        let length_and_flags = u64::from_le_bytes(raw[8..16].try_into().ok()?);
        let timestamp = u64::from_le_bytes(raw[16..24].try_into().ok()?);
        Some(Self {
            path: String::from_utf8_lossy(&path_bytes[..path_len]).into_owned(),
            size: length_and_flags & LENGTH_MASK,
            start_offset,
            flags: (length_and_flags >> 56) as u8,
            timestamp,
        })
    }
}

/// In-memory metadata unit
#[derive(Debug, Clone)]
pub struct MetadataUnit {
    buffer: Vec<u8>,
    record_count: u32,
}

impl MetadataUnit {
    pub fn new() -> Self {
        let mut unit = Self {
            buffer: vec![0u8; UNIT_SIZE],
            record_count: 0,
        };
        unit.write_header();
        unit
    }

    fn write_header(&mut self) {
        let header = &mut self.buffer[FILE_TABLE_START..FILE_TABLE_START + FILE_TABLE_HEADER_SIZE];
        header[0..4].copy_from_slice(&FILE_TABLE_MAGIC);
        header[4] = FILE_TABLE_VERSION;
        header[5] = 0;
        header[6..8].copy_from_slice(&(FILE_RECORD_SIZE as u16).to_le_bytes());
        header[8..12].copy_from_slice(&self.record_count.to_le_bytes());
    }

    pub fn set_root(&mut self, slot: usize, root: &[u8; ROOT_SIZE]) -> Result<(), EncodingError> {
        if slot >= MAX_ROOTS {
            return Err(EncodingError::RootTableFull(slot));
        }
        let offset = slot * ROOT_SIZE;
        self.buffer[offset..offset + ROOT_SIZE].copy_from_slice(root);
        Ok(())
    }

    pub fn root(&self, slot: usize) -> Option<[u8; ROOT_SIZE]> {
        if slot >= MAX_ROOTS {
            return None;
        }
        let offset = slot * ROOT_SIZE;
        self.buffer[offset..offset + ROOT_SIZE].try_into().ok()
    }

    /// Append a record, returning its index in the table.
    pub fn append_file(&mut self, record: &FileRecord) -> Result<u32, EncodingError> {
        let index = self.record_count as usize;
        if index >= MAX_FILE_RECORDS {
            return Err(EncodingError::FileTableFull(index));
        }
        let offset = FILE_TABLE_START + FILE_TABLE_HEADER_SIZE + index * FILE_RECORD_SIZE;
        self.buffer[offset..offset + FILE_RECORD_SIZE].copy_from_slice(&record.to_bytes());
        self.record_count += 1;
        self.write_header();
        Ok(index as u32)
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Live file records in table order
    pub fn records(&self) -> Vec<FileRecord> {
        let start = FILE_TABLE_START + FILE_TABLE_HEADER_SIZE;
        (0..self.record_count as usize)
            .filter_map(|i| {
                let offset = start + i * FILE_RECORD_SIZE;
                FileRecord::from_bytes(&self.buffer[offset..offset + FILE_RECORD_SIZE])
            })
            .collect()
    }

    pub fn find(&self, path: &str) -> Option<FileRecord> {
        self.records().into_iter().find(|r| r.path == path)
    }

    /// Parse a stored metadata unit.
    pub fn parse(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != UNIT_SIZE {
            return Err(EncodingError::WrongUnitSize {
                expected: UNIT_SIZE,
                actual: bytes.len(),
            });
        }
        let header = &bytes[FILE_TABLE_START..FILE_TABLE_START + FILE_TABLE_HEADER_SIZE];
        if header[0..4] != FILE_TABLE_MAGIC {
            return Err(EncodingError::BadMagic);
        }
        if header[4] != FILE_TABLE_VERSION {
            return Err(EncodingError::UnsupportedLayout(format!(
                "version {}",
                header[4]
            )));
        }
        let record_size = u16::from_le_bytes([header[6], header[7]]) as usize;
        if record_size != FILE_RECORD_SIZE {
            return Err(EncodingError::UnsupportedLayout(format!(
                "record size {}",
                record_size
            )));
        }
        let record_count = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if record_count as usize > MAX_FILE_RECORDS {
            return Err(EncodingError::FileTableFull(record_count as usize));
        }

        Ok(Self {
            buffer: bytes.to_vec(),
            record_count,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for MetadataUnit {
    fn default() -> Self {
        Self::new()
    }
}
