//! Delete a saved board.

use anyhow::{Context, Result};
use std::path::Path;
use tower_client::persistence::clear_board;
use tower_client::FileStore;

use super::room_dir;

/// Run the clear command. The peer identity is kept.
pub async fn run(data_dir: &Path, room: &str) -> Result<()> {
    let dir = room_dir(data_dir, room);
    if !dir.exists() {
        println!("No saved board for room '{}'.", room);
        return Ok(());
    }

    clear_board(&FileStore::new(&dir))
        .await
        .context("Failed to clear saved board")?;
    println!("Cleared the saved board for room '{}'.", room);
    Ok(())
}
