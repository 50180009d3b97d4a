//! # mdsync CLI
//!
//! Runs metadata sync point simulations and inspects configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mdsync_config::{log_cli_info, Config, WriteStrategy};

mod simulate;

/// mdsync - metadata cache sync points for processes sharing one file
#[derive(Parser)]
#[command(name = "mdsync")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a workload on a group of simulated processes
    Simulate(SimulateArgs),

    /// Show or check configuration
    Config {
        /// Print the built-in defaults instead of the effective configuration
        #[arg(long)]
        default: bool,

        /// Validate a configuration file and exit
        #[arg(long, value_name = "FILE", conflicts_with = "default")]
        check: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of simulated processes
    #[arg(short = 'n', long, default_value_t = 4)]
    pub ranks: usize,

    /// Write strategy: centralized or distributed
    #[arg(short, long)]
    pub strategy: Option<WriteStrategy>,

    /// Dirty bytes that trigger a sync point
    #[arg(short, long)]
    pub threshold: Option<u64>,

    /// TOML workload file
    #[arg(short, long, value_name = "FILE", conflicts_with_all = ["entries", "seed"])]
    pub workload: Option<PathBuf>,

    /// Entries in a generated workload
    #[arg(short, long, default_value_t = 1000)]
    pub entries: usize,

    /// Seed for a generated workload
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Print the full outcome as JSON
    #[arg(long)]
    pub json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    mdsync_config::reload().context("Failed to load configuration")?;
    let config = mdsync_config::config();
    mdsync_config::logging::init_logging(config.logging.level()?);

    match cli.command {
        Commands::Simulate(args) => simulate::cmd_simulate(&config, &args),
        Commands::Config { default, check } => cmd_config(&config, default, check.as_deref()),
    }
}

fn cmd_config(config: &Config, default: bool, check: Option<&Path>) -> Result<()> {
    if let Some(path) = check {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let checked = Config::load_from(None, path)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        checked
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        log_cli_info!("Configuration checked", path = tracing::field::display(path.display()));
        println!("OK: {}", path.display());
        return Ok(());
    }

    if default {
        print!("{}", Config::default_toml());
        return Ok(());
    }

    config.validate()?;
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{}", rendered);
    if let Some(global) = Config::global_config_path() {
        eprintln!("Global: {}", global.display());
    }
    eprintln!("Project: .mdsync/config.toml");
    Ok(())
}
