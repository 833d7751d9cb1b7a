//! Splits a file into raw chunks of at most one unit's payload capacity

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::unit::UNIT_CAPACITY;

/// Reads from an async reader and yields fixed-size raw chunks
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    bytes_read: u64,
    chunks_read: u64,
    eof_reached: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Chunker sized to one unit's payload capacity
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, UNIT_CAPACITY)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            bytes_read: 0,
            chunks_read: 0,
            eof_reached: false,
        }
    }

    /// Read the next chunk.
    ///
    /// Every chunk is exactly `chunk_size` bytes except the last, which may
    /// be shorter. Returns `Ok(None)` once the reader is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            match self.reader.read(&mut buffer[filled..]).await? {
                0 => {
                    self.eof_reached = true;
                    break;
                }
                n => filled += n,
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        self.bytes_read += filled as u64;
        self.chunks_read += 1;
        Ok(Some(buffer))
    }
}

impl<R> Chunker<R> {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total raw bytes yielded so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_chunks_with_partial_tail() {
        let data = b"hello world";
        let mut chunker = Chunker::with_chunk_size(&data[..], 5);

        assert_eq!(chunker.next_chunk().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(chunker.next_chunk().await.unwrap(), Some(b" worl".to_vec()));
        assert_eq!(chunker.next_chunk().await.unwrap(), Some(b"d".to_vec()));
        assert_eq!(chunker.next_chunk().await.unwrap(), None);

        assert_eq!(chunker.bytes_read(), 11);
        assert_eq!(chunker.chunks_read(), 3);
    }

    #[tokio::test]
    async fn test_empty_reader_yields_nothing() {
        let data: &[u8] = b"";
        let mut chunker = Chunker::new(data);
        assert_eq!(chunker.next_chunk().await.unwrap(), None);
        assert!(chunker.is_eof());
        assert_eq!(chunker.bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let data = vec![7u8; 30];
        let mut chunker = Chunker::with_chunk_size(&data[..], 10);
        let mut count = 0;
        while let Some(chunk) = chunker.next_chunk().await.unwrap() {
            assert_eq!(chunk.len(), 10);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_default_is_unit_capacity() {
        let data = vec![1u8; UNIT_CAPACITY + 100];
        let mut chunker = Chunker::new(&data[..]);
        assert_eq!(chunker.chunk_size(), UNIT_CAPACITY);

        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), UNIT_CAPACITY);
        assert_eq!(chunker.next_chunk().await.unwrap().unwrap().len(), 100);
        assert_eq!(chunker.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chunk_contents_preserve_order() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mut chunker = Chunker::with_chunk_size(&data[..], 64);
        let mut joined = Vec::new();
        while let Some(chunk) = chunker.next_chunk().await.unwrap() {
            joined.extend_from_slice(&chunk);
        }
        assert_eq!(joined, data);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be greater than 0")]
    fn test_zero_chunk_size_panics() {
        let data = b"test";
        let _chunker = Chunker::with_chunk_size(&data[..], 0);
    }
}
