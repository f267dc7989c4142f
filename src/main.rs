use clap::Parser;
use log::{error, info, warn};
use opsmon::config::MonitorConfig;
use opsmon::error::ConfigError;
use opsmon::usage::MemoryUsageRepository;
use opsmon::MonitorService;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command-line arguments for the monitoring engine
#[derive(Parser)]
#[command(
    name = "opsmon",
    about = "Operational monitoring engine - event log, alerts, usage tracking and status",
    long_about = "Runs the operational monitoring engine: a bounded event log, client liveness \
                  tracking, a rule-based alert lifecycle, provider usage and cost monitoring \
                  and periodic tiered status snapshots."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable debug logging output")]
    verbose: bool,
}

impl Cli {
    /// Reject config paths that exist but are not files
    ///
    /// Missing files are allowed; `load_config` falls back to defaults.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() && !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }
            if config_path.extension().is_some_and(|ext| ext != "toml") {
                warn!(
                    "Configuration file does not have .toml extension: {}",
                    config_path.display()
                );
            }
        }
        Ok(())
    }
}

/// Load the configuration, falling back to defaults when the file is
/// missing or invalid
fn load_config(config_path: Option<&Path>) -> MonitorConfig {
    let Some(path) = config_path else {
        info!("Using default configuration");
        return MonitorConfig::default();
    };

    info!("Loading configuration from: {}", path.display());
    match MonitorConfig::from_file(path) {
        Ok(config) => config,
        Err(ConfigError::ReadError(e)) => {
            warn!("Configuration file unreadable ({}), using defaults", e);
            MonitorConfig::default()
        }
        Err(e) => {
            error!("Configuration error in '{}': {}", path.display(), e);
            warn!("Using default configuration due to invalid config file");
            MonitorConfig::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("Starting operational monitor");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = load_config(cli.config.as_deref());
    let repository = Arc::new(MemoryUsageRepository::new());
    let mut service = MonitorService::new(config, repository);
    service.start()?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down gracefully...");
        if let Err(e) = shutdown_tx.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })?;

    info!("Operational monitor is running. Press Ctrl+C to stop.");
    shutdown_rx.recv().await;

    let drained = service.stop().await?;
    info!("Shutdown complete, {} usage records drained", drained);
    Ok(())
}
