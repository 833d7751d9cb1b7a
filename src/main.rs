//! nilstore - client for the NilStore content-addressed storage network
//!
//! Builds slabs from files, uploads them to storage providers and fetches
//! file ranges back over the gateway, a provider, or libp2p.

use nilstore_core::{run, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let (config, command) = Config::from_cli()?;

    init_logging(&config.log_level);

    tracing::debug!("Running {:?}", command);

    run(config, command).await?;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
