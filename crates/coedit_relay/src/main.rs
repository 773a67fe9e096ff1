use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use coedit_relay::config::{LogFormat, RelayConfig};
use coedit_relay::{logging, metrics, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "coedit-relay")]
#[command(about = "Relay server for collaborative plain-text editing sessions", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "COEDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds a joiner waits for the host's snapshot
    #[arg(long)]
    sync_timeout: Option<u64>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.sync_timeout {
            config.sync_timeout_secs = secs;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    logging::init(config.log_format, args.verbose)?;
    info!(addr = %config.listen_addr(), sync_timeout_secs = config.sync_timeout_secs, "Starting CoEdit relay");

    let server = Arc::new(RelayServer::new(config));
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    match metrics::render() {
        Some(Ok(text)) => info!("Final metrics:\n{text}"),
        Some(Err(e)) => error!(error = %e, "Failed to render metrics"),
        None => {}
    }
    Ok(())
}
