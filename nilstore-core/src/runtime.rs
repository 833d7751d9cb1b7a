//! Command dispatch
//!
//! Wires configuration to the pipeline components for each CLI command and
//! owns their lifecycles: the engine worker, the local cache, the p2p client
//! and the gateway monitor.

use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::LocalCache;
use crate::config::{Command, Config, ConfigError, FetchCommand, ShardCommand, StatusCommand, UploadCommand};
use crate::engine::Blake3Engine;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::retrieval::{RetrievalRequest, Retriever};
use crate::slab::{Slab, SlabBuilder};
use crate::transport::{ConnectionState, GatewayMonitor, P2pClient, TransportRouter, TransportStatus};
use crate::upload::{UploadPipeline, UploadTarget};
use crate::worker::EngineClient;

/// Run one command to completion
pub async fn run(config: Config, command: Command) -> Result<()> {
    let metrics = Metrics::new();

    let result = match command {
        Command::Shard(cmd) => shard(&config, cmd, &metrics).await,
        Command::Upload(cmd) => upload(&config, cmd, &metrics).await,
        Command::Fetch(cmd) => fetch(&config, cmd, &metrics).await,
        Command::Status(cmd) => status(&config, cmd).await,
    };

    info!("Metrics: {}", metrics.summary());
    if let Err(e) = &result {
        error!(reason = e.reason(), "{}", e);
    }
    result
}

/// Token cancelled on Ctrl+C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let guard = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling...");
            guard.cancel();
        }
    });
    token
}

fn open_cache(config: &Config) -> Result<Option<LocalCache>> {
    if !config.cache_enabled {
        return Ok(None);
    }
    std::fs::create_dir_all(&config.cache_dir)?;
    Ok(Some(LocalCache::open(&config.cache_dir)?))
}

async fn build_slab(file: &Path, metrics: &Metrics) -> Result<Slab> {
    let engine = EngineClient::spawn(Blake3Engine::new())?;
    let builder = SlabBuilder::with_metrics(engine.clone(), metrics.clone());
    let slab = builder.build_from_path(file).await;
    if let Err(e) = engine.shutdown().await {
        debug!("Engine shutdown: {}", e);
    }
    Ok(slab?)
}

fn print_slab(slab: &Slab) {
    println!("manifest_root: {}", slab.manifest_root);
    println!("file: {} ({} bytes)", slab.file.path, slab.file.size);
    println!(
        "units: {} (1 metadata, {} witness, {} user)",
        slab.total_units(),
        slab.witness_unit_count,
        slab.user_unit_count
    );
}

async fn shard(config: &Config, cmd: ShardCommand, metrics: &Metrics) -> Result<()> {
    let slab = build_slab(&cmd.file, metrics).await?;
    print_slab(&slab);

    if let Some(deal) = cmd.deal_id {
        match open_cache(config)? {
            Some(cache) => cache.put_slab(deal, &slab).await?,
            None => warn!("Cache disabled; units not stored"),
        }
    }
    Ok(())
}

async fn upload(config: &Config, cmd: UploadCommand, metrics: &Metrics) -> Result<()> {
    let provider_base = config.provider_base.clone().ok_or_else(|| {
        ConfigError::Invalid("upload needs --provider-base".to_string())
    })?;

    let slab = build_slab(&cmd.file, metrics).await?;
    print_slab(&slab);

    let target = UploadTarget {
        provider_base,
        deal_id: cmd.deal_id,
        manifest_root: slab.manifest_root,
    };
    let pipeline = UploadPipeline::with_metrics(target, config.request_timeout(), metrics.clone())?;
    let cancel = ctrl_c_token();

    let all_successful = pipeline.upload_with_cancel(&slab.units, &cancel).await?;
    if !all_successful {
        return Err(Error::UploadIncomplete {
            failed: pipeline.failed_units(),
            total: slab.units.len(),
        });
    }
    pipeline.upload_manifest(&slab.manifest_blob).await?;

    if let Some(cache) = open_cache(config)? {
        cache.put_slab(cmd.deal_id, &slab).await?;
    }
    println!("uploaded {} units to deal {}", slab.units.len(), cmd.deal_id);
    Ok(())
}

async fn fetch(config: &Config, cmd: FetchCommand, metrics: &Metrics) -> Result<()> {
    let router = TransportRouter::with_metrics(config.router_options(), metrics.clone());
    let endpoints = config.endpoints();
    let wants_p2p = !endpoints.p2p_peers.is_empty();

    let mut retriever = Retriever::new(router, endpoints)?.with_metrics(metrics.clone());
    if let Some(cache) = open_cache(config)? {
        retriever = retriever.with_cache(cache);
    }
    if wants_p2p {
        let client = P2pClient::spawn(config.request_timeout())?;
        retriever = retriever.with_p2p(Arc::new(client));
    }

    let mut request = RetrievalRequest::new(cmd.deal_id, cmd.manifest_root, &cmd.owner, &cmd.file_path)
        .with_range(cmd.range_start, cmd.range_len);
    request.expected_provider = cmd.expected_provider;

    let cancel = ctrl_c_token();
    let retrieved = match retriever.fetch(&request, &cancel).await {
        Ok(retrieved) => retrieved,
        Err(e) => {
            if let Some(trace) = e.trace() {
                for attempt in &trace.attempts {
                    warn!(
                        backend = %attempt.backend,
                        skipped = attempt.skipped,
                        error = attempt.error_message.as_deref().unwrap_or(""),
                        "Attempt failed"
                    );
                }
            }
            return Err(e.into());
        }
    };
    if let Ok(json) = serde_json::to_string(&retrieved.trace) {
        debug!(trace = %json, "Routing decision");
    }

    match &cmd.out {
        Some(path) => {
            tokio::fs::write(path, &retrieved.data).await?;
            info!(
                "Wrote {} bytes to {:?} via {}",
                retrieved.data.len(),
                path,
                retrieved.backend
            );
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&retrieved.data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

fn print_status(status: &TransportStatus) {
    let state = serde_json::to_string(&status.state).unwrap_or_default();
    let state = state.trim_matches('"');
    match (&status.last_error, &status.details) {
        (Some(err), _) => println!("gateway: {} ({})", state, err),
        (None, Some(details)) => println!(
            "gateway: {} (version {}, mode {}, {} p2p addrs)",
            state,
            details.version,
            details.mode,
            details.p2p_addrs.len()
        ),
        (None, None) => println!("gateway: {}", state),
    }
}

async fn status(config: &Config, cmd: StatusCommand) -> Result<()> {
    let base = config
        .gateway_base
        .clone()
        .ok_or_else(|| ConfigError::Invalid("status needs --gateway-base".to_string()))?;
    let monitor = GatewayMonitor::http(&base, config.monitor_config())?;
    let mut rx = monitor.subscribe();

    if cmd.once {
        let settled = rx
            .wait_for(|s| matches!(s.state, ConnectionState::Connected | ConnectionState::Error))
            .await
            .map(|s| s.clone());
        monitor.shutdown().await;
        if let Ok(status) = settled {
            print_status(&status);
        }
        return Ok(());
    }

    info!("Monitoring gateway at {} (Ctrl+C to stop)", base);
    let mut last_state = None;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = rx.borrow_and_update().clone();
                if last_state != Some(status.state) {
                    print_status(&status);
                    last_state = Some(status.state);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}
