//! RocksDB-backed local cache of slab units and downloaded files
//!
//! Everything is namespaced by deal:
//!
//! - `deal/<id>/manifest_root` holds the manifest root of the cached slab
//! - `deal/<id>/unit/<index>` holds encoded unit bytes by slab index
//! - `deal/<id>/file/<hash>` holds a downloaded file, keyed by a hash of its path
//!
//! File ranges can be served straight from cached units: the metadata unit
//! locates the file in user data, and the witness unit count tells where user
//! data starts in the slab.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ids::{DealId, ValidationError};
use crate::manifest::ManifestRoot;
use crate::metadata::MetadataUnit;
use crate::slab::{expected_witness_units, Slab};
use crate::unit::{self, EncodingError, UNIT_CAPACITY};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Cached unit is corrupt: {0}")]
    Corrupt(#[from] EncodingError),

    #[error("Invalid cache request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn deal_prefix(deal: DealId) -> String {
    format!("deal/{}/", deal)
}

fn manifest_key(deal: DealId) -> String {
    format!("deal/{}/manifest_root", deal)
}

fn unit_key(deal: DealId, index: u64) -> String {
    format!("deal/{}/unit/{:08}", deal, index)
}

fn file_prefix(deal: DealId) -> String {
    format!("deal/{}/file/", deal)
}

/// Stable cache name for a file path.
pub fn file_key(deal: DealId, path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    format!("{}{}", file_prefix(deal), hex::encode(&digest[..16]))
}

fn join_error(e: tokio::task::JoinError) -> CacheError {
    CacheError::IoError(std::io::Error::other(e.to_string()))
}

/// Local persistent cache
#[derive(Clone)]
pub struct LocalCache {
    db: Arc<DB>,
}

impl LocalCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Units are already dense scalar data
        opts.set_compression_type(rocksdb::DBCompressionType::None);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_target_file_size_base(128 * 1024 * 1024);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened local cache at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    async fn get(&self, key: String) -> Result<Option<Vec<u8>>, CacheError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(join_error)?
            .map_err(CacheError::from)
    }

    /// Store every unit of a slab and mark its manifest root.
    ///
    /// Replaces whatever slab was cached for the deal before.
    pub async fn put_slab(&self, deal: DealId, slab: &Slab) -> Result<(), CacheError> {
        let mut batch = WriteBatch::default();
        for unit in &slab.units {
            batch.put(unit_key(deal, unit.index), &unit.bytes);
        }
        batch.put(manifest_key(deal), slab.manifest_root.to_string());

        let stale_from = slab.units.len() as u64;
        let db = Arc::clone(&self.db);
        let unit_prefix = format!("deal/{}/unit/", deal);
        tokio::task::spawn_blocking(move || {
            // Drop units left over from a larger slab
            let start = unit_key(deal, stale_from);
            for item in db.iterator(IteratorMode::From(start.as_bytes(), Direction::Forward)) {
                let (key, _) = item?;
                if !key.starts_with(unit_prefix.as_bytes()) {
                    break;
                }
                batch.delete(key);
            }
            db.write(batch)
        })
        .await
        .map_err(join_error)??;

        info!(
            deal_id = %deal,
            manifest_root = %slab.manifest_root,
            units = slab.units.len(),
            "Cached slab"
        );
        Ok(())
    }

    pub async fn manifest_root(&self, deal: DealId) -> Result<Option<ManifestRoot>, CacheError> {
        let Some(raw) = self.get(manifest_key(deal)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&raw);
        Ok(Some(text.parse()?))
    }

    pub async fn get_unit(&self, deal: DealId, index: u64) -> Result<Option<Vec<u8>>, CacheError> {
        self.get(unit_key(deal, index)).await
    }

    /// Write a downloaded file once. Returns `false` if an entry already
    /// existed, leaving it untouched.
    pub async fn put_file_entry(
        &self,
        deal: DealId,
        path: &str,
        data: Vec<u8>,
    ) -> Result<bool, CacheError> {
        let key = file_key(deal, path);
        let db = Arc::clone(&self.db);
        let len = data.len();
        let written = tokio::task::spawn_blocking(move || {
            if db.get(&key)?.is_some() {
                debug!("File entry already cached: {}", key);
                return Ok::<bool, CacheError>(false);
            }
            db.put(&key, &data)?;
            Ok(true)
        })
        .await
        .map_err(join_error)??;

        if written {
            debug!(deal_id = %deal, path, bytes = len, "Cached file entry");
        }
        Ok(written)
    }

    pub async fn get_file_entry(&self, deal: DealId, path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.get(file_key(deal, path)).await
    }

    pub async fn delete_file_entry(&self, deal: DealId, path: &str) -> Result<(), CacheError> {
        let key = file_key(deal, path);
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.delete(&key))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    /// Serve a file range from cached units. `len` of `None` reads to the
    /// end of the file; longer ranges are clamped to it.
    ///
    /// Returns `Ok(None)` when the deal's metadata, the file, or any unit the
    /// range touches is not cached.
    pub async fn read_file_range(
        &self,
        deal: DealId,
        path: &str,
        start: u64,
        len: Option<u64>,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(meta_bytes) = self.get_unit(deal, 0).await? else {
            return Ok(None);
        };
        let metadata = MetadataUnit::parse(&meta_bytes)?;
        let Some(record) = metadata.find(path) else {
            return Ok(None);
        };
        if start >= record.size {
            return Err(ValidationError::InvalidRange(format!(
                "range start {} beyond end of {} ({} bytes)",
                start, path, record.size
            ))
            .into());
        }

        let logical_len = metadata
            .records()
            .iter()
            .map(|r| r.end_offset())
            .max()
            .unwrap_or(0);
        let user_units = unit::units_for(logical_len) as usize;
        let first_user = 1 + expected_witness_units(user_units) as u64;
        let capacity = UNIT_CAPACITY as u64;

        let want = len.unwrap_or(u64::MAX).min(record.size - start);
        let mut out = Vec::with_capacity(want as usize);
        let mut abs = record.start_offset + start;
        let end = abs + want;

        while abs < end {
            let user_index = abs / capacity;
            let within = (abs % capacity) as usize;
            let valid_len = (logical_len - user_index * capacity).min(capacity) as usize;
            let take = ((end - abs) as usize).min(valid_len - within);

            let Some(unit_bytes) = self.get_unit(deal, first_user + user_index).await? else {
                return Ok(None);
            };
            out.extend(unit::decode_range(&unit_bytes, within, take, valid_len)?);
            abs += take as u64;
        }

        Ok(Some(out))
    }

    /// Remove downloaded file entries, keeping units.
    pub async fn clear_file_entries(&self, deal: DealId) -> Result<usize, CacheError> {
        self.delete_prefix(file_prefix(deal)).await
    }

    /// Remove everything cached for a deal.
    pub async fn clear_deal(&self, deal: DealId) -> Result<usize, CacheError> {
        let removed = self.delete_prefix(deal_prefix(deal)).await?;
        info!(deal_id = %deal, removed, "Cleared deal from cache");
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: String) -> Result<usize, CacheError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();
            let mut count = 0;
            for item in db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward)) {
                let (key, _) = item?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                batch.delete(key);
                count += 1;
            }
            db.write(batch)?;
            Ok::<usize, CacheError>(count)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Blake3Engine;
    use crate::slab::SlabBuilder;
    use crate::worker::EngineClient;
    use tempfile::TempDir;

    fn open_cache() -> (TempDir, LocalCache) {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    async fn build_slab(name: &str, data: &[u8]) -> Slab {
        let engine = EngineClient::spawn(Blake3Engine::new()).unwrap();
        SlabBuilder::new(engine).build_bytes(name, data).await.unwrap()
    }

    #[test]
    fn test_file_key_is_stable_and_namespaced() {
        let a = file_key(DealId(1), "movie.mp4");
        assert_eq!(a, file_key(DealId(1), "movie.mp4"));
        assert_ne!(a, file_key(DealId(2), "movie.mp4"));
        assert_ne!(a, file_key(DealId(1), "other.mp4"));
        assert!(a.starts_with("deal/1/file/"));
        assert_eq!(a.len(), "deal/1/file/".len() + 32);
    }

    #[tokio::test]
    async fn test_put_slab_and_read_units() {
        let (_dir, cache) = open_cache();
        let slab = build_slab("small.bin", b"hello cache").await;

        cache.put_slab(DealId(7), &slab).await.unwrap();

        assert_eq!(
            cache.manifest_root(DealId(7)).await.unwrap(),
            Some(slab.manifest_root)
        );
        for unit in &slab.units {
            assert_eq!(
                cache.get_unit(DealId(7), unit.index).await.unwrap().as_deref(),
                Some(unit.bytes.as_slice())
            );
        }
        assert_eq!(cache.manifest_root(DealId(8)).await.unwrap(), None);
        assert_eq!(cache.get_unit(DealId(8), 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_file_range_spanning_units() {
        let (_dir, cache) = open_cache();
        let data = pattern(UNIT_CAPACITY + 5_000);
        let slab = build_slab("big.bin", &data).await;
        cache.put_slab(DealId(1), &slab).await.unwrap();

        let start = UNIT_CAPACITY as u64 - 100;
        let got = cache
            .read_file_range(DealId(1), "big.bin", start, Some(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, &data[start as usize..start as usize + 300]);

        let tail = cache
            .read_file_range(DealId(1), "big.bin", UNIT_CAPACITY as u64 + 4_990, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tail, &data[UNIT_CAPACITY + 4_990..]);
    }

    #[tokio::test]
    async fn test_read_file_range_misses() {
        let (_dir, cache) = open_cache();
        assert_eq!(
            cache.read_file_range(DealId(1), "a.bin", 0, None).await.unwrap(),
            None
        );

        let slab = build_slab("a.bin", b"abc").await;
        cache.put_slab(DealId(1), &slab).await.unwrap();
        assert_eq!(
            cache.read_file_range(DealId(1), "b.bin", 0, None).await.unwrap(),
            None
        );
        assert!(matches!(
            cache.read_file_range(DealId(1), "a.bin", 3, None).await,
            Err(CacheError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_file_entries_write_once() {
        let (_dir, cache) = open_cache();
        let deal = DealId(3);

        assert!(cache.put_file_entry(deal, "a.txt", b"first".to_vec()).await.unwrap());
        assert!(!cache.put_file_entry(deal, "a.txt", b"second".to_vec()).await.unwrap());
        assert_eq!(
            cache.get_file_entry(deal, "a.txt").await.unwrap(),
            Some(b"first".to_vec())
        );

        cache.delete_file_entry(deal, "a.txt").await.unwrap();
        assert_eq!(cache.get_file_entry(deal, "a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_file_entries_keeps_units() {
        let (_dir, cache) = open_cache();
        let deal = DealId(4);
        let slab = build_slab("k.bin", b"keep me").await;
        cache.put_slab(deal, &slab).await.unwrap();
        cache.put_file_entry(deal, "k.bin", b"keep me".to_vec()).await.unwrap();

        assert_eq!(cache.clear_file_entries(deal).await.unwrap(), 1);
        assert_eq!(cache.get_file_entry(deal, "k.bin").await.unwrap(), None);
        assert!(cache.get_unit(deal, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_deal_is_scoped() {
        let (_dir, cache) = open_cache();
        let slab = build_slab("x.bin", b"x").await;
        cache.put_slab(DealId(1), &slab).await.unwrap();
        cache.put_slab(DealId(10), &slab).await.unwrap();

        let removed = cache.clear_deal(DealId(1)).await.unwrap();
        assert_eq!(removed, slab.units.len() + 1);
        assert_eq!(cache.manifest_root(DealId(1)).await.unwrap(), None);
        assert_eq!(
            cache.manifest_root(DealId(10)).await.unwrap(),
            Some(slab.manifest_root)
        );
    }
}
