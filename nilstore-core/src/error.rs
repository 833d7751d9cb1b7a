//! Crate-level error taxonomy
//!
//! Each module keeps its own error type; this enum gathers them for the
//! command layer and maps every failure to a short user-facing reason.

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::ids::ValidationError;
use crate::retrieval::RetrievalError;
use crate::slab::SlabError;
use crate::transport::{FramingError, P2PError, TransportError};
use crate::unit::EncodingError;
use crate::upload::UploadError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("commitment engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("slab build failed: {0}")]
    Slab(#[from] SlabError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("{} of {total} units failed to upload: {failed:?}", .failed.len())]
    UploadIncomplete { failed: Vec<u64>, total: usize },

    #[error("fetch failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("malformed peer response: {0}")]
    Framing(#[from] FramingError),

    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("p2p error: {0}")]
    P2p(#[from] P2PError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short label: malformed, rejected, timeout, unreachable, aborted,
    /// engine or invalid.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Encoding(_) | Error::Framing(_) | Error::Cache(_) => "malformed",
            Error::Engine(_) => "engine",
            Error::Slab(SlabError::Encoding(_)) => "malformed",
            Error::Slab(SlabError::Engine(_)) => "engine",
            Error::Slab(_) => "invalid",
            Error::Upload(UploadError::Aborted) => "aborted",
            Error::Upload(UploadError::Manifest(e)) => e.reason(),
            Error::Upload(_) => "invalid",
            Error::UploadIncomplete { .. } => "rejected",
            Error::Retrieval(e) => e.reason(),
            Error::Transport(e) => e.reason(),
            Error::Validation(_) | Error::Config(_) | Error::Io(_) => "invalid",
            Error::P2p(_) => "unreachable",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ErrorClass;
    use crate::upload::UploadUnitError;

    #[test]
    fn test_reason_labels() {
        let cases: Vec<(Error, &str)> = vec![
            (EncodingError::BadMagic.into(), "malformed"),
            (FramingError::TooShort(2).into(), "malformed"),
            (EngineError::NotReady.into(), "engine"),
            (SlabError::from(EngineError::WorkerGone).into(), "engine"),
            (ValidationError::EmptyFile.into(), "invalid"),
            (UploadError::Aborted.into(), "aborted"),
            (
                UploadError::Manifest(UploadUnitError::Rejected {
                    status: 400,
                    body: "bad".into(),
                })
                .into(),
                "rejected",
            ),
            (
                TransportError::new(ErrorClass::Timeout, "slow").into(),
                "timeout",
            ),
            (
                TransportError::new(ErrorClass::ConnectionRefused, "down").into(),
                "unreachable",
            ),
            (
                Error::UploadIncomplete {
                    failed: vec![1],
                    total: 3,
                },
                "rejected",
            ),
        ];
        for (err, reason) in cases {
            assert_eq!(err.reason(), reason, "{}", err);
        }
    }

    #[test]
    fn test_upload_incomplete_message() {
        let err = Error::UploadIncomplete {
            failed: vec![1, 4],
            total: 6,
        };
        assert_eq!(err.to_string(), "2 of 6 units failed to upload: [1, 4]");
    }
}
