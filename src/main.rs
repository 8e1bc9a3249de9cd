use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use sluice::config::{self, Config};
use sluice::{auth, Pooler};

/// Time clients get to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "PostgreSQL connection pooler")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let config = config::load_config(path)?;
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        None => {
            info!("No --config given, using default configuration");
            Config::default()
        }
    };

    let authenticator = Arc::from(auth::from_config(&config.auth));
    let pooler = Pooler::start(config, authenticator).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    pooler.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
