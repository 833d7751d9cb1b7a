//! Sequential unit upload to a storage provider
//!
//! Units are pushed one at a time in the order given. A failed unit is
//! recorded and the pipeline moves on; the caller decides whether to retry
//! the failed subset. Progress is published on a watch channel, reset at the
//! start of every upload.

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ids::DealId;
use crate::manifest::ManifestRoot;
use crate::metrics::Metrics;
use crate::slab::SlabUnit;
use crate::transport::TransportError;

pub const UPLOAD_UNIT_PATH: &str = "/sp/upload_mdu";
pub const UPLOAD_MANIFEST_PATH: &str = "/sp/upload_manifest";

pub const HEADER_DEAL_ID: &str = "X-Nil-Deal-ID";
pub const HEADER_UNIT_INDEX: &str = "X-Nil-Mdu-Index";
pub const HEADER_MANIFEST_ROOT: &str = "X-Nil-Manifest-Root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Uploading,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitProgress {
    pub index: u64,
    pub total: usize,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a single unit did not upload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadUnitError {
    #[error("Upload failed: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("aborted")]
    Aborted,
}

impl UploadUnitError {
    pub fn reason(&self) -> &'static str {
        match self {
            UploadUnitError::Rejected { .. } => "rejected",
            UploadUnitError::Transport(e) => e.reason(),
            UploadUnitError::Aborted => "aborted",
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload aborted")]
    Aborted,

    #[error("manifest blob missing")]
    EmptyManifest,

    #[error("manifest upload failed: {0}")]
    Manifest(UploadUnitError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where a slab is uploaded and what it is tagged with
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub provider_base: String,
    pub deal_id: DealId,
    pub manifest_root: ManifestRoot,
}

impl UploadTarget {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.provider_base.trim_end_matches('/'), path)
    }
}

pub struct UploadPipeline {
    client: Client,
    target: UploadTarget,
    progress: watch::Sender<Vec<UnitProgress>>,
    metrics: Metrics,
}

impl UploadPipeline {
    pub fn new(target: UploadTarget, request_timeout: Duration) -> Result<Self, UploadError> {
        Self::with_metrics(target, request_timeout, Metrics::new())
    }

    pub fn with_metrics(
        target: UploadTarget,
        request_timeout: Duration,
        metrics: Metrics,
    ) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        let (progress, _) = watch::channel(Vec::new());
        Ok(Self {
            client,
            target,
            progress,
            metrics,
        })
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<UnitProgress>> {
        self.progress.subscribe()
    }

    /// Snapshot of the current upload's progress records.
    pub fn progress(&self) -> Vec<UnitProgress> {
        self.progress.borrow().clone()
    }

    /// Indices of units that failed in the last upload.
    pub fn failed_units(&self) -> Vec<u64> {
        self.progress
            .borrow()
            .iter()
            .filter(|p| p.status == UnitStatus::Error)
            .map(|p| p.index)
            .collect()
    }

    /// Upload every unit in order. Returns `true` iff all were accepted.
    pub async fn upload(&self, units: &[SlabUnit]) -> bool {
        let never = CancellationToken::new();
        self.upload_with_cancel(units, &never).await.unwrap_or(false)
    }

    /// Like [`upload`](Self::upload), but stops at `cancel`: the in-flight
    /// unit is marked aborted and the remaining units stay pending.
    pub async fn upload_with_cancel(
        &self,
        units: &[SlabUnit],
        cancel: &CancellationToken,
    ) -> Result<bool, UploadError> {
        let total = units.len();
        self.progress.send_replace(
            units
                .iter()
                .map(|u| UnitProgress {
                    index: u.index,
                    total,
                    status: UnitStatus::Pending,
                    error: None,
                })
                .collect(),
        );

        info!(
            deal_id = %self.target.deal_id,
            manifest_root = %self.target.manifest_root,
            units = total,
            "Starting upload"
        );

        let mut all_successful = true;
        for (position, unit) in units.iter().enumerate() {
            self.set_status(position, UnitStatus::Uploading, None);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadUnitError::Aborted),
                result = self.send_unit(unit) => result,
            };

            match outcome {
                Ok(()) => {
                    self.metrics.unit_uploaded(unit.bytes.len());
                    self.set_status(position, UnitStatus::Complete, None);
                    info!(unit_index = unit.index, "Unit uploaded ({}/{})", position + 1, total);
                }
                Err(UploadUnitError::Aborted) => {
                    self.set_status(position, UnitStatus::Error, Some("aborted".to_string()));
                    warn!(unit_index = unit.index, "Upload aborted");
                    return Err(UploadError::Aborted);
                }
                Err(e) => {
                    all_successful = false;
                    self.metrics.unit_failed();
                    error!(unit_index = unit.index, reason = e.reason(), "Error uploading unit: {}", e);
                    self.set_status(position, UnitStatus::Error, Some(e.to_string()));
                }
            }
        }

        Ok(all_successful)
    }

    /// Upload the manifest blob once every unit is in place.
    pub async fn upload_manifest(&self, blob: &[u8]) -> Result<(), UploadError> {
        if blob.is_empty() {
            return Err(UploadError::EmptyManifest);
        }
        let request = self
            .client
            .post(self.target.url(UPLOAD_MANIFEST_PATH))
            .header(HEADER_DEAL_ID, self.target.deal_id.to_string())
            .header(HEADER_MANIFEST_ROOT, self.target.manifest_root.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(blob.to_vec());
        check_response(request.send().await)
            .await
            .map_err(UploadError::Manifest)?;

        info!(manifest_root = %self.target.manifest_root, "Manifest uploaded");
        Ok(())
    }

    async fn send_unit(&self, unit: &SlabUnit) -> Result<(), UploadUnitError> {
        let request = self
            .client
            .post(self.target.url(UPLOAD_UNIT_PATH))
            .header(HEADER_DEAL_ID, self.target.deal_id.to_string())
            .header(HEADER_UNIT_INDEX, unit.index.to_string())
            .header(HEADER_MANIFEST_ROOT, self.target.manifest_root.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(unit.bytes.clone());
        check_response(request.send().await).await
    }

    fn set_status(&self, position: usize, status: UnitStatus, error: Option<String>) {
        self.progress.send_modify(|records| {
            if let Some(record) = records.get_mut(position) {
                record.status = status;
                record.error = error;
            }
        });
    }
}

async fn check_response(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<(), UploadUnitError> {
    let response = result.map_err(TransportError::from)?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadUnitError::Rejected {
        status: status.as_u16(),
        body,
    })
}
