//! sss3 - command-line client for SSS3 broker sessions
//!
//! Negotiates exclusive access to simulated ECUs with a broker and bridges
//! their frames over multicast while the session is active.

mod commands;
mod config;
mod output;
mod prompt;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "sss3")]
#[command(author, version, about = "SSS3 broker session client")]
#[command(propagate_version = true)]
struct Cli {
    /// Broker address (host:port)
    #[arg(short, long, env = "SSS3_BROKER")]
    broker: Option<String>,

    /// Hardware identity presented to the broker
    #[arg(short, long, env = "SSS3_MAC")]
    mac: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "SSS3_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select devices and run a session until teardown or Ctrl+C
    Run {
        /// Do not print received frames
        #[arg(long)]
        no_frames: bool,

        /// Give up if the broker sends no setup within this many milliseconds
        #[arg(long)]
        setup_timeout_ms: Option<u64>,
    },

    /// List the devices the broker currently offers
    Devices,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(cli.broker.as_deref(), cli.mac.as_deref(), cli.no_color);

    let ctx = OutputContext::new(cli.output, merged.no_color, cli.quiet);

    match cli.command {
        Commands::Run {
            no_frames,
            setup_timeout_ms,
        } => {
            let mut client = merged.client;
            if setup_timeout_ms.is_some() {
                client.setup_timeout_ms = setup_timeout_ms;
            }
            commands::run(client, &ctx, !no_frames)?;
        }

        Commands::Devices => {
            commands::devices(&merged.client, &ctx)?;
        }
    }

    Ok(())
}
