//! Join a room and follow it until interrupted.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_client::channel::webrtc::WebRtcFactory;
use tower_client::{FileStore, RoomConfig, RoomEvent, Session};
use tower_types::{Element, ElementEvent, ElementId};
use tracing::debug;

use super::room_dir;

const RECT_WIDTH: f64 = 80.0;
const RECT_HEIGHT: f64 = 60.0;
const RECT_COLOR: &str = "#3b82f6";

/// Parse `X,Y` into a canvas point.
pub fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{}'", s))?;
    let x: f64 = x.trim().parse().map_err(|_| format!("invalid x coordinate '{}'", x))?;
    let y: f64 = y.trim().parse().map_err(|_| format!("invalid y coordinate '{}'", y))?;
    if !x.is_finite() || !y.is_finite() {
        return Err(format!("coordinates must be finite: '{}'", s));
    }
    Ok((x, y))
}

/// Run the join command.
pub async fn run(data_dir: &Path, config: &RoomConfig, room: &str, rect: Option<(f64, f64)>) -> Result<()> {
    let dir = room_dir(data_dir, room);
    tokio::fs::create_dir_all(&dir)
        .await
        .context("Failed to create room directory")?;

    let factory = WebRtcFactory::new(
        config.ice_servers.clone(),
        config.rendezvous.ice_timeout(),
        config.transport.low_water_mark,
    )
    .context("Failed to set up WebRTC")?;
    let relays = Session::connect_relays(&config.relays).context("Invalid relay URL")?;
    debug!("signaling relays: {:?}", config.relays);

    println!("Joining room '{}' via {} relay(s)...", room, relays.len());
    let session = Session::join(
        config,
        room,
        Arc::new(factory),
        relays,
        Arc::new(FileStore::new(&dir)),
    )
    .await
    .context("Failed to join room")?;
    println!("Joined as {}", session.self_id());
    println!("Press Ctrl-C to leave.");
    println!();

    if let Some((x, y)) = rect {
        let element = Element::rect(ElementId::generate(), x, y, RECT_WIDTH, RECT_HEIGHT, RECT_COLOR);
        let event = ElementEvent::Create(element);
        session.engine().apply_local(event.clone()).await?;
        let key = session.engine().commit(event).await?;
        println!("Drew rectangle at ({}, {}) [{}]", x, y, key);
    }

    let mut events = session.room().subscribe();
    let mut document = session.engine().subscribe();
    println!("Board: {} elements", document.borrow().len());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RoomEvent::PeerJoined(peer)) => {
                    println!("+ {} ({} connected)", peer, session.room().peer_count());
                }
                Ok(RoomEvent::PeerLeft(peer)) => {
                    println!("- {} ({} connected)", peer, session.room().peer_count());
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = document.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("Board: {} elements", document.borrow_and_update().len());
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("Leaving...");
    session.leave().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_point_accepts_pairs() {
        assert_eq!(parse_point("100,200"), Ok((100.0, 200.0)));
        assert_eq!(parse_point(" -1.5 , 2 "), Ok((-1.5, 2.0)));
    }

    #[test]
    fn parse_point_rejects_garbage() {
        assert!(parse_point("100").is_err());
        assert!(parse_point("a,2").is_err());
        assert!(parse_point("1,b").is_err());
        assert!(parse_point("inf,2").is_err());
    }
}
