//! weaverctl - command-line front end for a PipeWeaver daemon
//!
//! Subcommands:
//! - `weaverctl devices` - List controllable devices and their state
//! - `weaverctl watch [prefix]` - Print tree changes as they arrive
//! - `weaverctl volume <device> <value|+n|-n>` - Set or nudge a volume
//! - `weaverctl mute <device>` - Toggle mute
//! - `weaverctl link <device> [on|off|toggle]` - Link a source's mixes
//! - `weaverctl meter [device]` - Stream meter levels
//! - `weaverctl config` - Show the effective configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weaverconf::WeaverConfig;
use weaverproto::Mix;

mod commands;

use commands::LinkMode;

#[derive(Parser)]
#[command(name = "weaverctl")]
#[command(about = "Control a PipeWeaver daemon through weaverlink")]
#[command(version)]
struct Cli {
    /// Config file used in place of ./weaverlink.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices with volumes and mute state
    Devices,

    /// Print every change under a path prefix until interrupted
    Watch {
        /// JSON pointer prefix (default: whole tree)
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Set a volume (`40`) or nudge it (`+5`, `-5`)
    Volume {
        /// Device id or name
        device: String,

        /// Absolute 0-100, or a signed delta
        #[arg(allow_hyphen_values = true)]
        value: String,

        /// Source mix to change (repeatable, default A)
        #[arg(short, long = "mix", value_parser = commands::parse_mix)]
        mixes: Vec<Mix>,
    },

    /// Toggle mute on a target, or on a source's mixes
    Mute {
        /// Device id or name
        device: String,

        /// Source mix to toggle (repeatable, default A)
        #[arg(short, long = "mix", value_parser = commands::parse_mix)]
        mixes: Vec<Mix>,
    },

    /// Link or unlink a source's A and B volumes
    Link {
        /// Device id or name
        device: String,

        #[arg(value_enum, default_value = "toggle")]
        mode: LinkMode,
    },

    /// Stream meter levels until interrupted
    Meter {
        /// Device id or name (default: all)
        device: Option<String>,
    },

    /// Show the effective configuration and where it came from
    Config,
}

fn init_tracing(config: &WeaverConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.infra.telemetry.log_level));

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = WeaverConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.infra.daemon.host = host;
    }
    if let Some(port) = cli.port {
        config.infra.daemon.port = port;
    }

    init_tracing(&config);

    match cli.command {
        Commands::Devices => {
            commands::devices(&config).await?;
        }
        Commands::Watch { prefix } => {
            commands::watch(&config, &prefix).await?;
        }
        Commands::Volume {
            device,
            value,
            mixes,
        } => {
            let change = commands::parse_volume(&value)?;
            commands::volume(&config, &device, change, &mixes).await?;
        }
        Commands::Mute { device, mixes } => {
            commands::mute(&config, &device, &mixes).await?;
        }
        Commands::Link { device, mode } => {
            commands::link(&config, &device, mode).await?;
        }
        Commands::Meter { device } => {
            commands::meter(&config, device.as_deref()).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &sources);
        }
    }

    Ok(())
}
