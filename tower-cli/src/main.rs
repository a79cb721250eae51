//! # tower-cli
//!
//! Command line tool for tower rooms.
//!
//! ## Commands
//!
//! - `config`: Print the effective room configuration (or write a default one)
//! - `inspect`: Show the board saved for a room
//! - `clear`: Delete the board saved for a room
//! - `join`: Join a room over WebRTC and follow it (needs the `webrtc` feature)
//!
//! ## Example
//!
//! ```bash
//! # Write tower.toml with every default spelled out
//! tower-cli config --init
//!
//! # Join a room and draw a rectangle
//! tower-cli join sketches --rect 100,100
//!
//! # Look at what was saved
//! tower-cli inspect sketches
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tower_client::RoomConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[cfg(feature = "webrtc")]
use commands::join;
use commands::{clear, config, inspect};

/// Command line tool for tower rooms.
#[derive(Parser, Debug)]
#[command(name = "tower-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for saved boards and peer identities
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Room configuration file (default: <data-dir>/tower.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective room configuration
    Config {
        /// Write the defaults to the configuration path if nothing is there
        #[arg(long)]
        init: bool,
    },

    /// Show the board saved for a room
    Inspect {
        /// Room id
        room: String,
    },

    /// Delete the board saved for a room
    Clear {
        /// Room id
        room: String,
    },

    /// Join a room and print membership and document changes
    #[cfg(feature = "webrtc")]
    Join {
        /// Room id
        room: String,

        /// Room password (overrides the configuration)
        #[arg(long, short)]
        password: Option<String>,

        /// Draw a rectangle at X,Y after joining
        #[arg(long, value_parser = join::parse_point)]
        rect: Option<(f64, f64)>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    let config_path = cli.config.unwrap_or_else(|| data_dir.join("tower.toml"));

    match cli.command {
        Commands::Config { init } => {
            config::run(&config_path, init).await?;
        }
        Commands::Inspect { room } => {
            inspect::run(&data_dir, &room).await?;
        }
        Commands::Clear { room } => {
            clear::run(&data_dir, &room).await?;
        }
        #[cfg(feature = "webrtc")]
        Commands::Join {
            room,
            password,
            rect,
        } => {
            let mut room_config = load_config(&config_path)?;
            if let Some(password) = password {
                room_config.password = password;
            }
            join::run(&data_dir, &room_config, &room, rect).await?;
        }
    }

    Ok(())
}

/// Load the configuration file, or the defaults if there is none.
pub(crate) fn load_config(path: &Path) -> Result<RoomConfig> {
    if !path.exists() {
        return Ok(RoomConfig::default());
    }
    RoomConfig::from_file(path).with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Get the default data directory for tower-cli.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "qttn", "tower")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
