//! Show a saved board.

use anyhow::{Context, Result};
use std::path::Path;
use tower_client::persistence::{load_board, SELF_ID_KEY};
use tower_client::{FileStore, KeyValueStore, StoredBoard};
use tower_core::{Document, OperationLog};
use tower_types::{Element, Shape};

use super::room_dir;

/// Run the inspect command.
pub async fn run(data_dir: &Path, room: &str) -> Result<()> {
    let dir = room_dir(data_dir, room);
    println!("=== room '{}' ===", room);
    println!();

    if !dir.exists() {
        println!("No saved board.");
        println!();
        println!("Run 'tower-cli join {}' to start one.", room);
        return Ok(());
    }

    let store = FileStore::new(&dir);
    let peer = store
        .load(SELF_ID_KEY)
        .await
        .context("Failed to read peer identity")?;
    let board = load_board(&store).await.context("Saved board is unreadable")?;

    println!("Peer:     {}", peer.as_deref().map_or("(none yet)", |p| p.trim_matches('"')));
    println!("Log:      {} entries", board.history.len());
    match &board.snapshot {
        Some(snapshot) => println!(
            "Snapshot: {} ({} elements, hash {}...)",
            snapshot.id,
            snapshot.elements.len(),
            &snapshot.element_hash[..snapshot.element_hash.len().min(12)]
        ),
        None => println!("Snapshot: none"),
    }

    let document = materialize(&board);
    println!();
    println!("Elements: {}", document.len());
    for (_, element) in document.iter() {
        println!("  {}", describe(element));
    }

    Ok(())
}

/// Rebuild the document the way a joining peer would.
fn materialize(board: &StoredBoard) -> Document {
    let mut log = OperationLog::new();
    if let Some(snapshot) = &board.snapshot {
        log.set_captured(snapshot.captured_keys.clone());
    }
    log.merge(board.history.iter().cloned());
    Document::replay(board.snapshot.as_ref().map(|s| &s.elements), &log).document
}

fn describe(element: &Element) -> String {
    let geometry = match &element.shape {
        Shape::Rect { width, height } => format!("{}x{}", width, height),
        Shape::Circle { radius } => format!("r={}", radius),
        Shape::Line { points } => format!("{} points", points.len()),
    };
    format!(
        "{} {} at ({}, {}) {} {}",
        element.id,
        element.kind(),
        element.x,
        element.y,
        geometry,
        element.color
    )
}
