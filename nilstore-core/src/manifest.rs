//! Manifest root: the single identifier committed on-chain for a slab
//!
//! The manifest root is an order-sensitive fold of every unit root in slab
//! order `[metadata, witness.., user..]`. Reordering roots yields a
//! different manifest, so callers must preserve slab order exactly.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::engine::{EngineError, Root};
use crate::ids::{parse_hex_array, ValidationError};
use crate::worker::EngineClient;

/// 32-byte manifest identifier, rendered as `0x`-prefixed hex
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManifestRoot([u8; 32]);

impl ManifestRoot {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ManifestRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ManifestRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestRoot({})", self)
    }
}

impl FromStr for ManifestRoot {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_array::<32>(s).map(Self)
    }
}

impl Serialize for ManifestRoot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ManifestRoot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Aggregated manifest: the root plus the blob it commits to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestCommitment {
    pub root: ManifestRoot,
    pub blob: Vec<u8>,
}

/// Folds an ordered list of unit roots into a manifest through the engine
#[derive(Clone)]
pub struct ManifestAggregator {
    engine: EngineClient,
}

impl ManifestAggregator {
    pub fn new(engine: EngineClient) -> Self {
        Self { engine }
    }

    pub async fn aggregate(&self, roots_in_order: &[Root]) -> Result<ManifestCommitment, EngineError> {
        if roots_in_order.is_empty() {
            return Err(EngineError::InvalidInput("no roots to aggregate".to_string()));
        }
        let flat: Vec<u8> = roots_in_order.iter().flatten().copied().collect();
        let aggregation = self.engine.aggregate(flat).await?;
        let root = ManifestRoot(aggregation.root);
        debug!(roots = roots_in_order.len(), manifest_root = %root, "Aggregated manifest");

        Ok(ManifestCommitment {
            root,
            blob: aggregation.blob,
        })
    }
}
