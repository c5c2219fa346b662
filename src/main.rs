use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use byte_throttle::config::ThrottleConfig;
use byte_throttle::server::Server;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Demo server for byte-rate throttled responses.
#[derive(Debug, Parser)]
#[command(name = "byte-throttle", version, about)]
struct Args {
    #[arg(short, long, env = "BYTE_THROTTLE_PORT", default_value_t = 3000)]
    port: u16,

    /// JSON throttle configuration; flags below override its values.
    #[arg(short, long, env = "BYTE_THROTTLE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "BYTE_THROTTLE_BYTES_PER_SECOND")]
    bytes_per_second: Option<u64>,

    /// Maximum number of bandwidth pools kept in memory.
    #[arg(long)]
    capacity: Option<usize>,

    /// Idle lifetime of a bandwidth pool, e.g. `30m`.
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    ttl: Option<Duration>,

    #[arg(long, env = "BYTE_THROTTLE_LOG_LEVEL", default_value = "debug")]
    log_level: String,
}

impl Args {
    fn throttle_config(&self) -> Result<ThrottleConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                ThrottleConfig::from_json(&raw)?
            }
            None => ThrottleConfig::default(),
        };

        if let Some(bytes_per_second) = self.bytes_per_second {
            config.bytes_per_second = bytes_per_second;
        }
        if let Some(capacity) = self.capacity {
            config.store.capacity = capacity;
        }
        if let Some(ttl) = self.ttl {
            config.store.ttl = ttl;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("byte_throttle={},tower_http=debug", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.throttle_config()?;

    tracing::info!("Starting byte-throttle demo");
    tracing::info!(
        "Configuration: port={}, bytes_per_second={}, store_capacity={}, store_ttl={:?}",
        args.port,
        config.bytes_per_second,
        config.store.capacity,
        config.store.ttl
    );

    let server = Server::new(&config, args.port)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
