//! xacoord - distributed transaction coordinator daemon

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use xacoord::resource::ResourceRegistry;
use xacoord::{Coordinator, CoordinatorConfig};

/// xacoord - a two-phase commit coordinator
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transaction log file
    #[arg(short = 'l', long, default_value = "./xacoord_data/xacoord.log")]
    log_path: PathBuf,

    /// Node id stamped into every global transaction id
    #[arg(short, long, default_value = "1")]
    node_id: u32,

    /// Default transaction timeout in seconds
    #[arg(short, long, default_value = "60")]
    timeout: u64,

    /// Recovery interval in milliseconds
    #[arg(long, default_value = "5000")]
    recovery_interval_ms: u64,

    /// Base delay of the recovery backoff in milliseconds
    #[arg(long, default_value = "1000")]
    recovery_base_delay_ms: u64,

    /// Compaction interval in milliseconds
    #[arg(long, default_value = "30000")]
    compaction_interval_ms: u64,

    /// Timeout scan interval in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_scan_interval_ms: u64,

    /// Skip fsync after every log write
    #[arg(long)]
    no_sync: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            log_path: self.log_path.clone(),
            node_id: self.node_id,
            default_timeout: Duration::from_secs(self.timeout),
            timeout_scan_interval: Duration::from_millis(self.timeout_scan_interval_ms),
            recovery_interval: Duration::from_millis(self.recovery_interval_ms),
            recovery_base_delay: Duration::from_millis(self.recovery_base_delay_ms),
            compaction_interval: Duration::from_millis(self.compaction_interval_ms),
            sync_on_write: !self.no_sync,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = args.config();
    log::info!("xacoord v{}", env!("CARGO_PKG_VERSION"));
    log::info!("transaction log: {}", config.log_path.display());

    // Resource managers and peer coordinators are registered by embedding
    // applications; the daemon drives recovery and maintenance of the log.
    let registry = Arc::new(ResourceRegistry::new());
    let coordinator =
        Coordinator::open(config, registry).context("Failed to open coordinator")?;

    let stats = coordinator.recover_now();
    log::info!(
        "startup recovery: {} resolved, {} still in doubt",
        stats.committed + stats.rolled_back + stats.cleaned,
        coordinator.repository().in_error_count()
    );

    coordinator
        .start_workers()
        .context("Failed to start background workers")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    log::info!("shutting down");
    coordinator.shutdown()?;
    Ok(())
}
