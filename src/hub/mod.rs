//! The hub: a WebSocket broker for multi-room agent chat.
//!
//! One `Hub` owns every room and every connected client. Connections are
//! handled in [`connection`], request dispatch lives in [`ops`], and the
//! snapshot loop in [`persistence`].

mod connection;
mod ops;
pub mod persistence;

pub use connection::{ws_handler, ClientConn};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::routing::any;
use axum::Router;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::room::RoomState;
use crate::types::Event;
use crate::validation::validate_name;

/// Per-client outbound queue depth, in frames.
pub const SEND_QUEUE_DEPTH: usize = 256;

/// Identifier for a connected client within this hub.
pub type ClientId = u64;

/// The central message broker.
pub struct Hub {
    rooms: DashMap<String, Arc<RoomState>>,
    clients: DashMap<ClientId, Arc<ClientConn>>,
    subs: DashMap<String, HashSet<ClientId>>,
    default_room: String,
    data_dir: PathBuf,
    desktop_token: Option<String>,
    next_client_id: AtomicU64,
}

impl Hub {
    /// Create a hub rooted at `data_dir`. `desktop_token` is the shared
    /// secret required for `identify` as a desktop client; `None` disables
    /// the check (development mode).
    pub fn new(
        data_dir: impl Into<PathBuf>,
        default_room: impl Into<String>,
        desktop_token: Option<String>,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            clients: DashMap::new(),
            subs: DashMap::new(),
            default_room: default_room.into(),
            data_dir: data_dir.into(),
            desktop_token: desktop_token.filter(|t| !t.is_empty()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn default_room(&self) -> &str {
        &self.default_room
    }

    /// The axum router exposing the hub's single `/ws` endpoint.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", any(ws_handler))
            .with_state(Arc::clone(self))
    }

    /// Room name to operate on: the default room when the request left it
    /// empty. Client-supplied names are validated here so no handler can
    /// reach a room (or its snapshot path) with an unchecked name.
    pub(crate) fn resolve_room(&self, room: &str) -> Result<String, String> {
        validate_name(room)?;
        Ok(if room.is_empty() {
            self.default_room.clone()
        } else {
            room.to_string()
        })
    }

    pub(crate) fn get_or_create_room(&self, room: &str) -> Arc<RoomState> {
        self.rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(RoomState::new()))
            .clone()
    }

    /// Install a pre-built room (startup restore).
    pub(crate) fn insert_room(&self, name: String, room: RoomState) {
        self.rooms.insert(name, Arc::new(room));
    }

    pub(crate) fn rooms(&self) -> &DashMap<String, Arc<RoomState>> {
        &self.rooms
    }

    pub(crate) fn desktop_token(&self) -> Option<&str> {
        self.desktop_token.as_deref()
    }

    /// Register a new connection and hand back its handle.
    pub(crate) fn register_client(&self, tx: mpsc::Sender<String>) -> Arc<ClientConn> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientConn::new(id, tx));
        self.clients.insert(id, Arc::clone(&client));
        info!("client {} connected (total: {})", id, self.clients.len());
        client
    }

    /// Drop a connection from the registry and from every room it was
    /// subscribed to.
    pub(crate) fn unregister_client(&self, client: &ClientConn) {
        self.clients.remove(&client.id());
        for room in client.subscribed_rooms() {
            if let Some(mut subs) = self.subs.get_mut(&room) {
                subs.remove(&client.id());
            }
        }
        info!(
            "client {} disconnected (total: {})",
            client.id(),
            self.clients.len()
        );
    }

    /// Add a client to a room's subscriber set.
    pub(crate) fn subscribe(&self, client: &ClientConn, room: &str) {
        client.add_room(room);
        self.subs
            .entry(room.to_string())
            .or_default()
            .insert(client.id());
        debug!("client {} subscribed to room {room:?}", client.id());
    }

    /// Fan an event out to every subscriber of `room`. Frames are enqueued
    /// non-blocking; a client with a full queue loses the frame.
    pub(crate) fn broadcast_event(&self, room: &str, event: &str, data: Value) {
        let event = Event {
            kind: "event".to_string(),
            event: event.to_string(),
            room: room.to_string(),
            data,
        };
        let frame = match serde_json::to_string(&event) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to serialize {} event: {e}", event.event);
                return;
            }
        };

        let Some(subs) = self.subs.get(room) else {
            return;
        };
        for id in subs.iter() {
            if let Some(client) = self.clients.get(id) {
                client.send_frame(frame.clone());
            }
        }
    }

    /// Path of the file advertising the bound port.
    pub fn port_file(&self) -> PathBuf {
        self.data_dir.join("hub.port")
    }

    /// Advertise the bound port. Written atomically so a concurrent reader
    /// never sees a partial file.
    pub fn write_port_file(&self, port: u16) -> anyhow::Result<()> {
        use anyhow::Context;
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {:?}", self.data_dir))?;
        let tmp = self.data_dir.join("hub.port.tmp");
        std::fs::write(&tmp, format!("{port}\n")).context("writing hub.port")?;
        std::fs::rename(&tmp, self.port_file()).context("publishing hub.port")?;
        info!("hub listening on localhost:{port}");
        Ok(())
    }

    /// Persist everything and withdraw the port advertisement.
    pub async fn shutdown(&self) {
        persistence::persist_all(self).await;
        if let Err(e) = std::fs::remove_file(self.port_file()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove hub.port: {e}");
            }
        }
        info!("hub shut down");
    }
}
