//! Gateway reachability monitor
//!
//! A background poll loop probes the gateway on a fixed interval and
//! publishes a [`TransportStatus`] on a watch channel. Probes are serialized,
//! carry their own deadline and are skipped entirely while the gateway's
//! backoff says it is not yet eligible. Dropping the [`GatewayMonitor`]
//! cancels the loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::{ErrorClass, TransportError};
use crate::backoff::{BackoffConfig, BackoffState};

/// How long gateway-advertised p2p addresses stay usable
pub const P2P_ADDR_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Parsed `GET /status` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatusInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub provider_base: Option<String>,
    #[serde(default)]
    pub p2p_addrs: Vec<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub deps: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    /// `None` when the gateway only answers `/health`
    pub details: Option<GatewayStatusInfo>,
    pub connected_at: Option<Instant>,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            details: None,
            connected_at: None,
        }
    }
}

/// A single reachability check
#[async_trait]
pub trait StatusProbe: Send + Sync + 'static {
    async fn probe(&self) -> Result<Option<GatewayStatusInfo>, TransportError>;
}

/// Probes `GET /status`, falling back to `GET /health` when `/status` is 404
pub struct HttpStatusProbe {
    client: reqwest::Client,
    base: String,
}

impl HttpStatusProbe {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, TransportError> {
        Ok(self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await?)
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn probe(&self) -> Result<Option<GatewayStatusInfo>, TransportError> {
        let status = self.get("/status").await?;
        if status.status().is_success() {
            let info = status.json::<GatewayStatusInfo>().await.map_err(|e| {
                TransportError::new(ErrorClass::InvalidResponse, format!("bad /status payload: {}", e))
            })?;
            return Ok(Some(info));
        }
        if status.status() != reqwest::StatusCode::NOT_FOUND {
            let code = status.status().as_u16();
            return Err(TransportError::http(code, status.text().await.unwrap_or_default()));
        }

        let health = self.get("/health").await?;
        let code = health.status();
        if code.is_success() {
            return Ok(None);
        }
        Err(TransportError::http(code.as_u16(), health.text().await.unwrap_or_default()))
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            probe_timeout: Duration::from_millis(3_000),
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct GatewayMonitor {
    status: watch::Receiver<TransportStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GatewayMonitor {
    /// Start polling an HTTP gateway.
    pub fn http(base: &str, config: MonitorConfig) -> Result<Self, TransportError> {
        let probe = HttpStatusProbe::new(base, config.probe_timeout)?;
        info!(gateway = base, "Starting gateway monitor");
        Ok(Self::spawn(probe, config))
    }

    pub fn spawn<P: StatusProbe>(probe: P, config: MonitorConfig) -> Self {
        let (tx, rx) = watch::channel(TransportStatus::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(Arc::new(probe), config, tx, cancel.clone()));
        Self {
            status: rx,
            cancel,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> TransportStatus {
        self.status.borrow().clone()
    }

    /// Gateway-advertised p2p addresses from a recent successful probe
    pub fn p2p_addrs(&self) -> Vec<String> {
        let status = self.status.borrow();
        match (&status.details, status.connected_at) {
            (Some(details), Some(at)) if at.elapsed() <= P2P_ADDR_TTL => details.p2p_addrs.clone(),
            _ => Vec::new(),
        }
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("Gateway monitor task failed: {}", e);
        }
    }
}

impl Drop for GatewayMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    probe: Arc<dyn StatusProbe>,
    config: MonitorConfig,
    tx: watch::Sender<TransportStatus>,
    cancel: CancellationToken,
) {
    let mut backoff = BackoffState::new(config.backoff);

    loop {
        if backoff.can_attempt(Instant::now()) {
            tx.send_modify(|status| status.state = ConnectionState::Connecting);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(config.probe_timeout, probe.probe()) => {
                    result.unwrap_or_else(|_| Err(TransportError::timeout(config.probe_timeout)))
                }
            };

            match outcome {
                Ok(details) => {
                    if backoff.failures() > 0 {
                        info!("Gateway reachable again");
                    }
                    backoff.record_success();
                    tx.send_replace(TransportStatus {
                        state: ConnectionState::Connected,
                        last_error: None,
                        details,
                        connected_at: Some(Instant::now()),
                    });
                }
                Err(err) => {
                    let delay = backoff.record_failure(Instant::now());
                    warn!(
                        error = %err,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Gateway probe failed"
                    );
                    tx.send_modify(|status| {
                        status.state = ConnectionState::Error;
                        status.last_error = Some(err.to_string());
                    });
                }
            }
        } else {
            trace!(
                retry_in_ms = backoff.retry_in(Instant::now()).as_millis() as u64,
                "Gateway probe skipped during backoff"
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    tx.send_modify(|status| status.state = ConnectionState::Disconnected);
    debug!("Gateway monitor stopped");
}
