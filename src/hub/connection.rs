//! Per-connection state and the WebSocket read/write pumps.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response as HttpResponse;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ClientId, Hub, SEND_QUEUE_DEPTH};
use crate::types::{Request, Response};

/// Largest inbound frame the hub will read.
const MAX_MESSAGE_SIZE: usize = 1 << 20;
/// Interval between keepalive pings.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// A connection silent for this long is considered dead.
const PONG_WAIT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Identity {
    client_type: String,
    agent_name: String,
    joined_room: String,
    desktop_ok: bool,
    rooms: HashSet<String>,
}

/// One WebSocket connection to the hub.
///
/// The hub addresses clients only through the bounded `tx` queue; dropping
/// the registry entry tears the writer down, so no cycle outlives a
/// disconnect.
pub struct ClientConn {
    id: ClientId,
    tx: mpsc::Sender<String>,
    ident: Mutex<Identity>,
}

impl ClientConn {
    pub(crate) fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            ident: Mutex::new(Identity::default()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    fn ident(&self) -> std::sync::MutexGuard<'_, Identity> {
        self.ident.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_identity(&self, client_type: &str, agent_name: &str, desktop_ok: bool) {
        let mut id = self.ident();
        id.client_type = client_type.to_string();
        id.agent_name = agent_name.to_string();
        id.desktop_ok = desktop_ok;
    }

    pub(crate) fn set_joined(&self, agent_name: &str, room: &str) {
        let mut id = self.ident();
        id.agent_name = agent_name.to_string();
        id.joined_room = room.to_string();
    }

    pub(crate) fn clear_joined(&self) {
        let mut id = self.ident();
        id.agent_name.clear();
        id.joined_room.clear();
    }

    pub(crate) fn agent_name(&self) -> String {
        self.ident().agent_name.clone()
    }

    pub(crate) fn joined_room(&self) -> String {
        self.ident().joined_room.clone()
    }

    pub(crate) fn is_desktop(&self) -> bool {
        self.ident().desktop_ok
    }

    pub(crate) fn add_room(&self, room: &str) {
        self.ident().rooms.insert(room.to_string());
    }

    pub(crate) fn subscribed_rooms(&self) -> Vec<String> {
        self.ident().rooms.iter().cloned().collect()
    }

    /// Enqueue a pre-serialized frame, dropping it if the client is slow.
    pub(crate) fn send_frame(&self, frame: String) {
        if self.tx.try_send(frame).is_err() {
            warn!(
                "send buffer full, dropping frame for client {} ({})",
                self.id,
                self.ident().agent_name
            );
        }
    }

    pub(crate) fn send_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("failed to serialize outbound frame: {e}"),
        }
    }

    pub(crate) fn send_ok(&self, id: &str, request_type: &str, data: Value) {
        self.send_json(&Response {
            id: id.to_string(),
            request_type: request_type.to_string(),
            success: true,
            data: Some(data),
            error: None,
        });
    }

    pub(crate) fn send_error(&self, id: &str, request_type: &str, error: impl Into<String>) {
        self.send_json(&Response {
            id: id.to_string(),
            request_type: request_type.to_string(),
            success: false,
            data: None,
            error: Some(error.into()),
        });
    }
}

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> HttpResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_DEPTH);
    let client = hub.register_client(tx);

    // Write pump: drains the queue in batches, one WebSocket frame per
    // entry, and keeps the connection alive with periodic pings.
    let write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // immediate first tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                    while let Ok(frame) = rx.try_recv() {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read pump: any inbound frame (including pongs) resets the liveness
    // deadline.
    loop {
        let next = tokio::time::timeout(PONG_WAIT, receiver.next()).await;
        let msg = match next {
            Err(_) => {
                info!("client {} timed out waiting for pong", client.id());
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("client {} read error: {e}", client.id());
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<Request>(&text) {
                Ok(req) => hub.handle_request(&client, req),
                Err(e) => {
                    debug!("client {} sent invalid JSON: {e}", client.id());
                    client.send_error("", "", "invalid JSON");
                }
            },
            Message::Binary(_) => {
                debug!("client {} sent binary frame, ignoring", client.id());
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    hub.unregister_client(&client);
    drop(client);
    write_task.abort();
}
