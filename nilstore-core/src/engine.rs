//! Commitment engine interface
//!
//! The engine turns units into per-blob commitments, unit roots and the
//! aggregated manifest root. Production engines wrap a polynomial commitment
//! scheme with loaded setup parameters; [`Blake3Engine`] is a deterministic
//! hash-based engine with identical shapes, used for local sharding and tests.

use thiserror::Error;

use crate::unit::{BLOBS_PER_UNIT, BLOB_SIZE, COMMITMENT_BYTES, UNIT_SIZE};

pub type Root = [u8; 32];
pub type Commitment = [u8; COMMITMENT_BYTES];

/// Maximum number of roots one aggregation blob can hold
pub const MAX_AGGREGATE_ROOTS: usize = BLOB_SIZE / 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("commitment engine is not initialized")]
    NotReady,

    #[error("commitment engine worker has stopped")]
    WorkerGone,

    #[error("invalid engine input: {0}")]
    InvalidInput(String),

    #[error("operation not supported by this engine: {0}")]
    Unsupported(String),

    #[error("engine failure: {0}")]
    Failed(String),
}

/// Output of expanding one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// One commitment per blob, in blob order
    pub witness: Vec<Commitment>,
    pub shards: Vec<Vec<u8>>,
}

impl Expansion {
    pub fn witness_flat(&self) -> Vec<u8> {
        self.witness.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub root: Root,
    pub blob: Vec<u8>,
}

/// Functional interface to a commitment engine.
///
/// Engines are stateful and owned by exactly one worker thread.
pub trait CommitmentEngine: Send + 'static {
    fn expand(&mut self, unit: &[u8]) -> Result<Expansion, EngineError>;

    /// Erasure-coded variant producing `k` data shards and `m` parity shards.
    fn expand_striped(&mut self, unit: &[u8], k: usize, m: usize)
        -> Result<Expansion, EngineError>;

    fn commit_root(&mut self, witness_flat: &[u8]) -> Result<Root, EngineError>;

    fn commit_blobs(&mut self, data: &[u8]) -> Result<Commitment, EngineError>;

    fn aggregate(&mut self, roots_flat: &[u8]) -> Result<Aggregation, EngineError>;
}

const BLOB_CONTEXT: &str = "nilstore 2025-01 blob commitment";
const NODE_CONTEXT: &str = "nilstore 2025-01 witness node";
const MANIFEST_CONTEXT: &str = "nilstore 2025-01 manifest root";

/// Deterministic blake3-based engine.
///
/// Produces 48-byte blob commitments with the XOF, a binary merkle root over
/// a unit's witness and an order-sensitive manifest root over the
/// aggregation blob. Parity shards are not supported.
#[derive(Debug, Default, Clone)]
pub struct Blake3Engine {
    calls: u64,
}

impl Blake3Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of engine operations served
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn commit_blob(blob: &[u8]) -> Commitment {
        let mut hasher = blake3::Hasher::new_derive_key(BLOB_CONTEXT);
        hasher.update(&(blob.len() as u64).to_le_bytes());
        hasher.update(blob);
        let mut out = [0u8; COMMITMENT_BYTES];
        hasher.finalize_xof().fill(&mut out);
        out
    }

    fn hash_node(left: &Root, right: &Root) -> Root {
        let mut hasher = blake3::Hasher::new_derive_key(NODE_CONTEXT);
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }

    fn check_unit(unit: &[u8]) -> Result<(), EngineError> {
        if unit.len() != UNIT_SIZE {
            return Err(EngineError::InvalidInput(format!(
                "unit must be {} bytes, got {}",
                UNIT_SIZE,
                unit.len()
            )));
        }
        Ok(())
    }
}

impl CommitmentEngine for Blake3Engine {
    fn expand(&mut self, unit: &[u8]) -> Result<Expansion, EngineError> {
        self.expand_striped(unit, 8, 0)
    }

    fn expand_striped(
        &mut self,
        unit: &[u8],
        k: usize,
        m: usize,
    ) -> Result<Expansion, EngineError> {
        Self::check_unit(unit)?;
        if m > 0 {
            return Err(EngineError::Unsupported(format!(
                "{} parity shards requested",
                m
            )));
        }
        if k == 0 || BLOBS_PER_UNIT % k != 0 {
            return Err(EngineError::InvalidInput(format!(
                "{} data shards do not divide {} blobs",
                k, BLOBS_PER_UNIT
            )));
        }
        self.calls += 1;

        let witness = unit.chunks(BLOB_SIZE).map(Self::commit_blob).collect();

        // Blob i lands in shard i % k so every shard holds one row of blobs
        let mut shards = vec![Vec::with_capacity(UNIT_SIZE / k); k];
        for (i, blob) in unit.chunks(BLOB_SIZE).enumerate() {
            shards[i % k].extend_from_slice(blob);
        }

        Ok(Expansion { witness, shards })
    }

    fn commit_root(&mut self, witness_flat: &[u8]) -> Result<Root, EngineError> {
        if witness_flat.is_empty() || witness_flat.len() % COMMITMENT_BYTES != 0 {
            return Err(EngineError::InvalidInput(format!(
                "witness length {} is not a positive multiple of {}",
                witness_flat.len(),
                COMMITMENT_BYTES
            )));
        }
        self.calls += 1;

        let mut level: Vec<Root> = witness_flat
            .chunks(COMMITMENT_BYTES)
            .map(|c| *blake3::hash(c).as_bytes())
            .collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Self::hash_node(left, right),
                    // odd node is promoted unchanged
                    _ => pair[0],
                })
                .collect();
        }
        Ok(level[0])
    }

    fn commit_blobs(&mut self, data: &[u8]) -> Result<Commitment, EngineError> {
        if data.len() > BLOB_SIZE {
            return Err(EngineError::InvalidInput(format!(
                "blob data of {} bytes exceeds {}",
                data.len(),
                BLOB_SIZE
            )));
        }
        self.calls += 1;

        let mut blob = vec![0u8; BLOB_SIZE];
        blob[..data.len()].copy_from_slice(data);
        Ok(Self::commit_blob(&blob))
    }

    fn aggregate(&mut self, roots_flat: &[u8]) -> Result<Aggregation, EngineError> {
        if roots_flat.is_empty() || roots_flat.len() % 32 != 0 {
            return Err(EngineError::InvalidInput(format!(
                "roots length {} is not a positive multiple of 32",
                roots_flat.len()
            )));
        }
        let count = roots_flat.len() / 32;
        if count > MAX_AGGREGATE_ROOTS {
            return Err(EngineError::InvalidInput(format!(
                "{} roots exceed aggregation capacity {}",
                count, MAX_AGGREGATE_ROOTS
            )));
        }
        self.calls += 1;

        let mut blob = vec![0u8; BLOB_SIZE];
        blob[..roots_flat.len()].copy_from_slice(roots_flat);

        let commitment = Self::commit_blob(&blob);
        let mut hasher = blake3::Hasher::new_derive_key(MANIFEST_CONTEXT);
        hasher.update(&(count as u64).to_le_bytes());
        hasher.update(&commitment);

        Ok(Aggregation {
            root: *hasher.finalize().as_bytes(),
            blob,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with(byte: u8) -> Vec<u8> {
        let mut unit = vec![0u8; UNIT_SIZE];
        unit[BLOB_SIZE * 3] = byte;
        unit
    }

    #[test]
    fn test_expand_shapes() {
        let mut engine = Blake3Engine::new();
        let expansion = engine.expand(&unit_with(7)).unwrap();
        assert_eq!(expansion.witness.len(), BLOBS_PER_UNIT);
        assert_eq!(expansion.witness_flat().len(), 3072);
        assert_eq!(expansion.shards.len(), 8);
        assert!(expansion.shards.iter().all(|s| s.len() == UNIT_SIZE / 8));
    }

    #[test]
    fn test_expand_only_changes_touched_blob() {
        let mut engine = Blake3Engine::new();
        let a = engine.expand(&unit_with(1)).unwrap();
        let b = engine.expand(&unit_with(2)).unwrap();
        for i in 0..BLOBS_PER_UNIT {
            if i == 3 {
                assert_ne!(a.witness[i], b.witness[i]);
            } else {
                assert_eq!(a.witness[i], b.witness[i], "blob {} should match", i);
            }
        }
    }

    #[test]
    fn test_expand_rejects_wrong_size_and_parity() {
        let mut engine = Blake3Engine::new();
        assert!(matches!(
            engine.expand(&[0u8; 10]),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.expand_striped(&unit_with(0), 8, 4),
            Err(EngineError::Unsupported(_))
        ));
        assert!(matches!(
            engine.expand_striped(&unit_with(0), 3, 0),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_commit_root_is_deterministic() {
        let mut engine = Blake3Engine::new();
        let witness = engine.expand(&unit_with(9)).unwrap().witness_flat();
        let first = engine.commit_root(&witness).unwrap();
        let second = engine.commit_root(&witness).unwrap();
        assert_eq!(first, second);

        let mut tampered = witness.clone();
        tampered[100] ^= 1;
        assert_ne!(engine.commit_root(&tampered).unwrap(), first);
        assert!(engine.commit_root(&witness[..47]).is_err());
    }

    #[test]
    fn test_commit_blobs_pads_short_input() {
        let mut engine = Blake3Engine::new();
        let short = engine.commit_blobs(b"abc").unwrap();
        let mut padded = b"abc".to_vec();
        padded.resize(BLOB_SIZE, 0);
        assert_eq!(short, engine.commit_blobs(&padded).unwrap());
        assert!(engine.commit_blobs(&vec![0u8; BLOB_SIZE + 1]).is_err());
    }

    #[test]
    fn test_aggregate_is_order_sensitive() {
        let mut engine = Blake3Engine::new();
        let roots: Vec<u8> = [[1u8; 32], [2u8; 32], [3u8; 32]].concat();
        let swapped: Vec<u8> = [[2u8; 32], [1u8; 32], [3u8; 32]].concat();

        let a = engine.aggregate(&roots).unwrap();
        let b = engine.aggregate(&swapped).unwrap();
        assert_ne!(a.root, b.root);
        assert_eq!(a.blob.len(), BLOB_SIZE);
        assert_eq!(&a.blob[32..64], &[2u8; 32]);
        assert_eq!(engine.aggregate(&roots).unwrap(), a);
    }

    #[test]
    fn test_aggregate_rejects_malformed_roots() {
        let mut engine = Blake3Engine::new();
        assert!(engine.aggregate(&[]).is_err());
        assert!(engine.aggregate(&[0u8; 33]).is_err());
        assert!(engine
            .aggregate(&vec![0u8; 32 * (MAX_AGGREGATE_ROOTS + 1)])
            .is_err());
    }
}
