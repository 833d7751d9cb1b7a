//! Slab building: one file in, one manifest root and an ordered unit set out
//!
//! Stages run strictly in sequence and every engine call is awaited before
//! the next unit is touched:
//!
//! 1. chunk the file into unit-capacity raw chunks
//! 2. encode and commit each chunk, collecting user roots and the witness stream
//! 3. fold the witness stream into witness units and commit them
//! 4. write the metadata unit (root table + file table) and commit it
//! 5. aggregate `[meta] + witness + user` roots into the manifest root
//!
//! Any failure discards the whole build.

use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::chunker::Chunker;
use crate::engine::{EngineError, Root};
use crate::ids::{basename, ValidationError};
use crate::manifest::{ManifestAggregator, ManifestRoot};
use crate::metadata::{FileRecord, MetadataUnit};
use crate::metrics::Metrics;
use crate::unit::{self, EncodingError, UNIT_CAPACITY, WITNESS_BYTES_PER_UNIT};
use crate::worker::EngineClient;

#[derive(Error, Debug)]
pub enum SlabError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("commitment engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Metadata,
    Witness,
    UserData,
}

/// One unit of a slab, addressed by its slab index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabUnit {
    pub index: u64,
    pub kind: UnitKind,
    pub bytes: Vec<u8>,
}

/// A fully committed slab
#[derive(Debug, Clone)]
pub struct Slab {
    pub manifest_root: ManifestRoot,
    pub manifest_blob: Vec<u8>,
    /// Index 0 is metadata, `1..=W` witness, the rest user data
    pub units: Vec<SlabUnit>,
    pub witness_unit_count: usize,
    pub user_unit_count: usize,
    pub file: FileRecord,
    /// Unit roots in aggregation order
    pub roots: Vec<Root>,
}

impl Slab {
    pub fn total_units(&self) -> usize {
        self.units.len()
    }

    pub fn metadata_unit(&self) -> &SlabUnit {
        &self.units[0]
    }

    pub fn user_units(&self) -> &[SlabUnit] {
        &self.units[1 + self.witness_unit_count..]
    }
}

/// Number of witness units a slab with `user_units` data units must carry.
pub fn expected_witness_units(user_units: usize) -> usize {
    (user_units * WITNESS_BYTES_PER_UNIT)
        .div_ceil(UNIT_CAPACITY)
        .max(1)
}

pub struct SlabBuilder {
    engine: EngineClient,
    aggregator: ManifestAggregator,
    metrics: Metrics,
}

impl SlabBuilder {
    pub fn new(engine: EngineClient) -> Self {
        Self::with_metrics(engine, Metrics::new())
    }

    pub fn with_metrics(engine: EngineClient, metrics: Metrics) -> Self {
        Self {
            aggregator: ManifestAggregator::new(engine.clone()),
            engine,
            metrics,
        }
    }

    /// Build a slab from a file on disk, recording its basename.
    pub async fn build_from_path(&self, path: &Path) -> Result<Slab, SlabError> {
        let name = basename(&path.to_string_lossy())?;
        let size = tokio::fs::metadata(path).await?.len();
        if size == 0 {
            return Err(ValidationError::EmptyFile.into());
        }
        let file = tokio::fs::File::open(path).await?;
        self.build(&name, file).await
    }

    /// Build a slab from an in-memory buffer.
    pub async fn build_bytes(&self, name: &str, data: &[u8]) -> Result<Slab, SlabError> {
        self.build(name, data).await
    }

    pub async fn build<R: AsyncRead + Unpin>(&self, name: &str, reader: R) -> Result<Slab, SlabError> {
        // Path is validated before any engine work
        FileRecord::new(name, 0, 0)?;

        let mut chunker = Chunker::new(reader);
        let mut user_roots = Vec::new();
        let mut witness_stream = Vec::new();
        let mut user_units = Vec::new();

        while let Some(chunk) = chunker.next_chunk().await? {
            let index = user_roots.len();
            let (root, witness, encoded) = self.commit_raw(&chunk).await?;
            debug!(user_index = index, raw_len = chunk.len(), "Committed user unit");
            witness_stream.extend_from_slice(&witness);
            user_roots.push(root);
            user_units.push(encoded);
        }

        let size = chunker.bytes_read();
        if user_roots.is_empty() {
            return Err(ValidationError::EmptyFile.into());
        }
        let record = FileRecord::new(name, size, 0)?;

        // Witness-of-witness folding is a single level
        let expected = expected_witness_units(user_roots.len());
        let mut witness_roots = Vec::with_capacity(expected);
        let mut witness_units = Vec::with_capacity(expected);
        for (index, chunk) in witness_stream.chunks(UNIT_CAPACITY).enumerate() {
            let (root, _, encoded) = self.commit_raw(chunk).await?;
            debug!(witness_index = index, raw_len = chunk.len(), "Committed witness unit");
            witness_roots.push(root);
            witness_units.push(encoded);
        }
        if witness_roots.len() != expected {
            return Err(EncodingError::WitnessCountMismatch {
                expected,
                actual: witness_roots.len(),
            }
            .into());
        }

        let mut metadata = MetadataUnit::new();
        for (slot, root) in witness_roots.iter().chain(user_roots.iter()).enumerate() {
            metadata.set_root(slot, root)?;
        }
        metadata.append_file(&record)?;
        let metadata_bytes = metadata.into_bytes();
        let (meta_root, _) = self.engine.commit_unit(metadata_bytes.clone()).await?;
        self.metrics.unit_committed(0);

        let mut roots = Vec::with_capacity(1 + witness_roots.len() + user_roots.len());
        roots.push(meta_root);
        roots.extend_from_slice(&witness_roots);
        roots.extend_from_slice(&user_roots);
        let manifest = self.aggregator.aggregate(&roots).await?;

        let witness_unit_count = witness_units.len();
        let user_unit_count = user_units.len();
        let mut units = Vec::with_capacity(roots.len());
        units.push(SlabUnit {
            index: 0,
            kind: UnitKind::Metadata,
            bytes: metadata_bytes,
        });
        let tail = witness_units
            .into_iter()
            .map(|bytes| (UnitKind::Witness, bytes))
            .chain(user_units.into_iter().map(|bytes| (UnitKind::UserData, bytes)));
        for (offset, (kind, bytes)) in tail.enumerate() {
            units.push(SlabUnit {
                index: offset as u64 + 1,
                kind,
                bytes,
            });
        }

        info!(
            file = %record.path,
            size,
            manifest_root = %manifest.root,
            witness_units = witness_unit_count,
            user_units = user_unit_count,
            "Slab built"
        );

        Ok(Slab {
            manifest_root: manifest.root,
            manifest_blob: manifest.blob,
            units,
            witness_unit_count,
            user_unit_count,
            file: record,
            roots,
        })
    }

    /// Encode a raw chunk and commit it, returning root, witness and unit bytes.
    async fn commit_raw(&self, raw: &[u8]) -> Result<(Root, Vec<u8>, Vec<u8>), SlabError> {
        if raw.len() > UNIT_CAPACITY {
            return Err(EncodingError::PayloadTooLarge {
                len: raw.len(),
                capacity: UNIT_CAPACITY,
            }
            .into());
        }
        let encoded = unit::encode(raw);
        let (root, witness) = self.engine.commit_unit(encoded.clone()).await?;
        self.metrics.unit_committed(raw.len());
        Ok((root, witness, encoded))
    }
}
