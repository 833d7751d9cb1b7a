//! NilStore Core
//!
//! Client-side ingestion and retrieval pipeline: slab building and manifest
//! aggregation, sequential upload to storage providers, and multi-transport
//! retrieval with per-backend backoff.

pub mod backoff;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod metadata;
pub mod metrics;
pub mod range;
pub mod retrieval;
pub mod runtime;
pub mod slab;
pub mod transport;
pub mod unit;
pub mod upload;
pub mod worker;

pub use backoff::{BackoffConfig, BackoffState};
pub use cache::{CacheError, LocalCache};
pub use chunker::Chunker;
pub use config::{Command, Config, ConfigError};
pub use engine::{Blake3Engine, CommitmentEngine, EngineError};
pub use error::Error;
pub use ids::{DealId, ValidationError};
pub use manifest::{ManifestAggregator, ManifestCommitment, ManifestRoot};
pub use metadata::{FileRecord, MetadataUnit};
pub use metrics::Metrics;
pub use range::{plan_range_chunks, RangeChunk};
pub use retrieval::{Endpoints, RetrievalError, RetrievalRequest, Retrieved, Retriever};
pub use runtime::run;
pub use slab::{Slab, SlabBuilder, SlabError, SlabUnit, UnitKind};
pub use unit::{decode, encode, EncodingError, UNIT_CAPACITY, UNIT_SIZE};
pub use upload::{UnitProgress, UnitStatus, UploadError, UploadPipeline, UploadTarget};
pub use worker::EngineClient;
