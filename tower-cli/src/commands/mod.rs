//! CLI command implementations.

pub mod clear;
pub mod config;
pub mod inspect;
#[cfg(feature = "webrtc")]
pub mod join;

use std::path::{Path, PathBuf};

/// Directory holding the saved board for `room`.
///
/// Characters outside `[A-Za-z0-9_-]` are replaced so any room id maps to a
/// single path component.
pub fn room_dir(data_dir: &Path, room: &str) -> PathBuf {
    let name: String = room
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    data_dir.join("rooms").join(name)
}
