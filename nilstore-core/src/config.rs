//! Configuration management for nilstore
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Precedence: CLI flags, then the `--config` TOML file, then defaults.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::ids::DealId;
use crate::manifest::ManifestRoot;
use crate::retrieval::Endpoints;
use crate::transport::{parse_peer_addr, MonitorConfig, RoutePreference, RouterOptions};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "nilstore")]
#[command(about = "Client-side slab builder, uploader and retriever for NilStore", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Gateway base URL (e.g. http://localhost:8080)
    #[arg(long, global = true)]
    pub gateway_base: Option<String>,

    /// Storage provider base URL for direct upload and fetch
    #[arg(long, global = true)]
    pub provider_base: Option<String>,

    /// Peer multiaddr ending in /p2p/<peer id> (can be specified multiple times)
    #[arg(long = "p2p-addr", global = true)]
    pub p2p_addrs: Vec<String>,

    /// Disable the peer-to-peer transport
    #[arg(long, global = true)]
    pub no_p2p: bool,

    /// auto, prefer_gateway, prefer_direct_sp or prefer_p2p
    #[arg(long, global = true)]
    pub route_preference: Option<RoutePreference>,

    /// Local cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Disable the local cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build a slab from a file and print its manifest root
    Shard(ShardCommand),
    /// Build a slab and upload it to a storage provider
    Upload(UploadCommand),
    /// Fetch a file or byte range
    Fetch(FetchCommand),
    /// Monitor gateway reachability
    Status(StatusCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct ShardCommand {
    pub file: PathBuf,

    /// Store the built units in the local cache under this deal
    #[arg(long)]
    pub deal_id: Option<DealId>,
}

#[derive(Parser, Debug, Clone)]
pub struct UploadCommand {
    pub file: PathBuf,

    #[arg(long)]
    pub deal_id: DealId,
}

#[derive(Parser, Debug, Clone)]
pub struct FetchCommand {
    #[arg(long)]
    pub deal_id: DealId,

    #[arg(long)]
    pub manifest_root: ManifestRoot,

    #[arg(long)]
    pub owner: String,

    #[arg(long)]
    pub file_path: String,

    #[arg(long, default_value_t = 0)]
    pub range_start: u64,

    /// Zero reads to the end of the file
    #[arg(long, default_value_t = 0)]
    pub range_len: u64,

    /// Only accept data served by this provider
    #[arg(long)]
    pub expected_provider: Option<String>,

    /// Output file; stdout when omitted
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct StatusCommand {
    /// Print the first settled status and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway_base: Option<String>,
    pub provider_base: Option<String>,
    pub p2p_addrs: Vec<String>,
    pub p2p_enabled: bool,
    pub route_preference: RoutePreference,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub log_level: String,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_attempts_per_backend: u32,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway_base: None,
            provider_base: None,
            p2p_addrs: Vec::new(),
            p2p_enabled: true,
            route_preference: RoutePreference::Auto,
            cache_dir: PathBuf::from("./nilstore-cache"),
            cache_enabled: true,
            log_level: "info".to_string(),
            probe_timeout_ms: 3_000,
            poll_interval_ms: 5_000,
            request_timeout_ms: 10_000,
            max_attempts_per_backend: 1,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    /// Parse the command line into a validated config and the command to run
    pub fn from_cli() -> Result<(Self, Command), ConfigError> {
        Self::from_parsed(Cli::parse())
    }

    pub fn from_parsed(cli: Cli) -> Result<(Self, Command), ConfigError> {
        let mut config = match &cli.global.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply(&cli.global);
        config.validate()?;
        Ok((config, cli.command))
    }

    /// Load config from TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay CLI flags on top of file/default values
    pub fn apply(&mut self, args: &GlobalArgs) {
        if let Some(base) = &args.gateway_base {
            self.gateway_base = Some(base.clone());
        }
        if let Some(base) = &args.provider_base {
            self.provider_base = Some(base.clone());
        }
        if !args.p2p_addrs.is_empty() {
            self.p2p_addrs = args.p2p_addrs.clone();
        }
        if args.no_p2p {
            self.p2p_enabled = false;
        }
        if let Some(preference) = args.route_preference {
            self.route_preference = preference;
        }
        if let Some(dir) = &args.cache_dir {
            self.cache_dir = dir.clone();
        }
        if args.no_cache {
            self.cache_enabled = false;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        if let Some(ms) = args.request_timeout_ms {
            self.request_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, base) in [
            ("gateway_base", &self.gateway_base),
            ("provider_base", &self.provider_base),
        ] {
            if let Some(base) = base {
                let url = reqwest::Url::parse(base)
                    .map_err(|e| ConfigError::Invalid(format!("{} {:?}: {}", name, base, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be an http(s) URL, got {:?}",
                        name, base
                    )));
                }
            }
        }
        for addr in &self.p2p_addrs {
            parse_peer_addr(addr).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        for (name, value) in [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        if self.max_attempts_per_backend == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts_per_backend must be > 0".to_string(),
            ));
        }
        if self.backoff.factor == 0 || self.backoff.base_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff needs factor >= 1 and base_ms <= max_ms, got {:?}",
                self.backoff
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            preference: self.route_preference,
            request_timeout: self.request_timeout(),
            max_attempts_per_backend: self.max_attempts_per_backend,
            max_total_attempts: None,
            backoff: self.backoff,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            backoff: self.backoff,
        }
    }

    /// Endpoints for retrieval; peers are dropped when p2p is disabled
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            gateway_base: self.gateway_base.clone(),
            provider_base: self.provider_base.clone(),
            p2p_peers: if self.p2p_enabled {
                self.p2p_addrs.clone()
            } else {
                Vec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Result<(Config, Command), ConfigError> {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Config::from_parsed(cli)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.probe_timeout_ms, 3_000);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.route_preference, RoutePreference::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fetch_command_from_cli() {
        let root = format!("0x{}", "ab".repeat(32));
        let (config, command) = parse(&[
            "nilstore",
            "--gateway-base",
            "http://localhost:8080",
            "--route-preference",
            "prefer_gateway",
            "fetch",
            "--deal-id",
            "12",
            "--manifest-root",
            &root,
            "--owner",
            "nil1abc",
            "--file-path",
            "video.mp4",
            "--range-len",
            "1024",
        ])
        .unwrap();

        assert_eq!(config.gateway_base.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.route_preference, RoutePreference::PreferGateway);
        match command {
            Command::Fetch(cmd) => {
                assert_eq!(cmd.deal_id, DealId(12));
                assert_eq!(cmd.manifest_root.to_string(), root);
                assert_eq!(cmd.range_start, 0);
                assert_eq!(cmd.range_len, 1024);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_bad_input() {
        assert!(parse(&["nilstore", "upload", "f.bin", "--deal-id", "abc"]).is_err());
        assert!(parse(&["nilstore", "--route-preference", "fastest", "status"]).is_err());
        assert!(parse(&["nilstore", "--gateway-base", "ftp://x", "status"]).is_err());
        assert!(parse(&["nilstore", "--p2p-addr", "/ip4/1.2.3.4/tcp/1", "status"]).is_err());
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
gateway_base = "http://file-gateway:8080"
provider_base = "http://file-sp:8082"
request_timeout_ms = 2500

[backoff]
base_ms = 1000
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let (config, _) = parse(&[
            "nilstore",
            "--config",
            path,
            "--gateway-base",
            "http://cli-gateway:9000",
            "status",
        ])
        .unwrap();

        assert_eq!(config.gateway_base.as_deref(), Some("http://cli-gateway:9000"));
        assert_eq!(config.provider_base.as_deref(), Some("http://file-sp:8082"));
        assert_eq!(config.request_timeout_ms, 2500);
        assert_eq!(config.backoff.base_ms, 1000);
        assert_eq!(config.backoff.max_ms, 60_000);
        assert_eq!(config.poll_interval_ms, 5_000);
    }

    #[test]
    fn test_disabling_p2p_drops_peers() {
        let mut config = Config::default();
        config.p2p_addrs = vec!["/ip4/127.0.0.1/tcp/9000/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN".into()];
        assert_eq!(config.endpoints().p2p_peers.len(), 1);
        config.p2p_enabled = false;
        assert!(config.endpoints().p2p_peers.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = Config {
            probe_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
