//! Room snapshots: startup load and the periodic dirty-room flush.
//!
//! Each room is persisted independently as `<dataDir>/hub-state/<room>.json`
//! via a temp-file-plus-rename, so a crash never leaves a torn snapshot.
//! Failures keep the dirty flag set and are retried on the next tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use super::Hub;
use crate::room::{PersistedRoom, RoomState};

/// How often dirty rooms are flushed to disk.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

fn state_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("hub-state")
}

impl Hub {
    /// Load every persisted room at startup. Unreadable or malformed files
    /// are logged and skipped; those rooms start empty on first use.
    pub fn load_persisted_state(&self) {
        let dir = state_dir(self.data_dir());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return, // nothing persisted yet
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(room_name) = name.strip_suffix(".json") else {
                continue;
            };

            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("failed to read persisted room {room_name:?}: {e}");
                    continue;
                }
            };
            let snapshot: PersistedRoom = match serde_json::from_slice(&data) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to parse persisted room {room_name:?}: {e}");
                    continue;
                }
            };

            info!(
                "loaded room {room_name:?}: {} messages, {} agents",
                snapshot.messages.len(),
                snapshot.agents.len()
            );
            let room = RoomState::new();
            room.restore(snapshot);
            self.insert_room(room_name.to_string(), room);
        }
    }
}

/// Run the snapshot loop until the hub shuts down. Spawned by the server.
pub async fn persist_loop(hub: Arc<Hub>) {
    let mut tick = tokio::time::interval(PERSIST_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        persist_dirty(&hub).await;
    }
}

/// Write every dirty room.
pub async fn persist_dirty(hub: &Hub) {
    let rooms: Vec<(String, Arc<RoomState>)> = hub
        .rooms()
        .iter()
        .filter(|e| e.value().is_dirty())
        .map(|e| (e.key().clone(), Arc::clone(e.value())))
        .collect();

    for (name, room) in rooms {
        persist_room(hub.data_dir(), &name, &room).await;
    }
}

/// Write every room regardless of dirtiness (shutdown path).
pub async fn persist_all(hub: &Hub) {
    let rooms: Vec<(String, Arc<RoomState>)> = hub
        .rooms()
        .iter()
        .map(|e| (e.key().clone(), Arc::clone(e.value())))
        .collect();

    for (name, room) in rooms {
        persist_room(hub.data_dir(), &name, &room).await;
    }
}

async fn persist_room(data_dir: &Path, name: &str, room: &RoomState) {
    let dir = state_dir(data_dir);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("failed to create state dir {dir:?}: {e}");
        return;
    }

    let snapshot = room.snapshot();
    let data = match serde_json::to_vec_pretty(&snapshot) {
        Ok(d) => d,
        Err(e) => {
            warn!("failed to serialize room {name:?}: {e}");
            return;
        }
    };

    let tmp = dir.join(format!("{name}.json.tmp"));
    let path = dir.join(format!("{name}.json"));

    if let Err(e) = tokio::fs::write(&tmp, &data).await {
        warn!("failed to write snapshot for room {name:?}: {e}");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        warn!("failed to publish snapshot for room {name:?}: {e}");
        let _ = tokio::fs::remove_file(&tmp).await;
        return;
    }

    room.mark_clean();
}
