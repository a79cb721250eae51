//! Print or initialize the room configuration.

use anyhow::{Context, Result};
use std::path::Path;
use tower_client::RoomConfig;

use crate::load_config;

/// Run the config command.
pub async fn run(path: &Path, init: bool) -> Result<()> {
    if init {
        if path.exists() {
            println!("{} already exists; leaving it alone.", path.display());
        } else {
            write_defaults(path).await?;
            println!("Wrote default configuration to {}", path.display());
        }
        println!();
    }

    let config = load_config(path)?;
    let source = if path.exists() {
        path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };

    println!("# effective configuration ({})", source);
    print!("{}", render(&config)?);
    Ok(())
}

/// Render a configuration with the password masked.
fn render(config: &RoomConfig) -> Result<String> {
    let mut shown = config.clone();
    if !shown.password.is_empty() {
        shown.password = "********".to_string();
    }
    shown.to_toml().context("Failed to render configuration")
}

async fn write_defaults(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create configuration directory")?;
    }
    let contents = RoomConfig::default()
        .to_toml()
        .context("Failed to render configuration")?;
    tokio::fs::write(path, contents)
        .await
        .context("Failed to write configuration")
}
