use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use booktape::config::{self, RecorderConfig};
use booktape::supervisor::{RunMode, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Record live venue streams
    Realtime,
    /// Seeded synthetic feed, no network
    Test,
}

/// Multi-venue order book recorder
#[derive(Parser, Debug)]
#[command(name = "booktape", version, about)]
struct Args {
    /// Path to a JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Mode::Realtime)]
    mode: Mode,

    /// Stop after this many hours; runs until ctrl-c when omitted
    #[arg(short, long)]
    duration: Option<f64>,

    /// Record only these venues (comma separated)
    #[arg(long, value_delimiter = ',')]
    venues: Vec<String>,

    /// Override every enabled venue's instrument list (comma separated)
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Override the output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("booktape=info".parse()?))
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let mode = match args.mode {
        Mode::Realtime => RunMode::Realtime,
        Mode::Test => RunMode::Test,
    };
    let duration = args
        .duration
        .map(|hours| Duration::from_secs_f64(hours * 3600.0));

    tracing::info!(
        venues = config.enabled_venues().count(),
        data_dir = %config.base_data_dir.display(),
        ?mode,
        "starting recorder"
    );

    Supervisor::new(config, mode, duration).run().await?;
    tracing::info!("recorder stopped");
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<RecorderConfig> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::default_config(),
    };
    if !args.venues.is_empty() {
        config.retain_venues(&args.venues);
    }
    if !args.symbols.is_empty() {
        config.override_symbols(&args.symbols);
    }
    if let Some(dir) = &args.data_dir {
        config.base_data_dir = dir.clone();
    }
    Ok(config)
}
