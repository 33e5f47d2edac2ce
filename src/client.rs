//! RPC client for the hub: one WebSocket, correlated request/response,
//! asynchronous event callbacks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::types::{AgentInfo, Event, Message, Request, Response};

/// Per-request deadline. Timed-out requests reclaim their pending slot.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Reconnect backoff starts here and doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Environment override for hub port discovery.
pub const HUB_PORT_ENV: &str = "AGENT_CHAT_HUB_PORT";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    on_event: RwLock<Option<EventHandler>>,
    closed: AtomicBool,
}

/// WebSocket RPC client for the hub.
pub struct HubClient {
    url: String,
    shared: Arc<Shared>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Resolve the hub URL: `AGENT_CHAT_HUB_PORT` wins, otherwise the port file
/// the hub wrote into `data_dir`.
pub fn discover_hub_addr(data_dir: &Path) -> Result<String> {
    if let Ok(port) = std::env::var(HUB_PORT_ENV) {
        if !port.trim().is_empty() {
            return Ok(format!("ws://localhost:{}/ws", port.trim()));
        }
    }
    let port_path = data_dir.join("hub.port");
    let data = std::fs::read_to_string(&port_path)
        .with_context(|| format!("hub.port not found at {port_path:?}"))?;
    Ok(format!("ws://localhost:{}/ws", data.trim()))
}

impl HubClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                on_event: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Register the callback invoked for every hub event frame. Call before
    /// [`connect`](Self::connect).
    pub fn set_event_handler(&self, handler: impl Fn(Event) + Send + Sync + 'static) {
        *self
            .shared
            .on_event
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Establish the WebSocket connection and start the read loop.
    pub async fn connect(&self) -> Result<()> {
        let (stream, _) = connect_async(&self.url)
            .await
            .with_context(|| format!("connecting to hub at {}", self.url))?;
        let (sink, source) = stream.split();

        *self.shared.writer.lock().await = Some(sink);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(read_loop(shared, source));
        if let Some(old) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }

        info!("connected to hub at {}", self.url);
        Ok(())
    }

    /// Connect with exponential backoff, up to `max_attempts` tries.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=max_attempts {
            if self.shared.closed.load(Ordering::SeqCst) {
                bail!("hub client closed");
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "hub connect attempt {attempt}/{max_attempts} failed: {e} \
                         (retrying in {backoff:?})"
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        bail!("failed to connect to hub after {max_attempts} attempts")
    }

    /// Close the connection and fail every in-flight request.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the senders wakes every waiter with a "closed" error.
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Send one request and wait for its correlated response.
    pub async fn send(&self, mut req: Request) -> Result<Response> {
        if self.shared.closed.load(Ordering::SeqCst) {
            bail!("hub client closed");
        }
        if req.id.is_empty() {
            req.id = Uuid::new_v4().to_string();
        }
        let id = req.id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        let frame = match serde_json::to_string(&req) {
            Ok(f) => f,
            Err(e) => {
                self.reclaim(&id);
                return Err(e.into());
            }
        };

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                drop(writer);
                self.reclaim(&id);
                bail!("not connected to hub");
            };
            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                drop(writer);
                self.reclaim(&id);
                return Err(anyhow!(e).context("hub write"));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => bail!("hub client closed while waiting for response"),
            Err(_) => {
                self.reclaim(&id);
                bail!("hub request timeout (id={id} type={})", req.kind)
            }
        }
    }

    fn reclaim(&self, id: &str) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    // --- Convenience wrappers ---

    pub async fn identify(
        &self,
        client_type: &str,
        agent_name: &str,
        room: &str,
        auth_token: &str,
    ) -> Result<()> {
        let resp = self
            .send(Request::new("identify").with_data(json!({
                "client_type": client_type,
                "agent_name": agent_name,
                "room": room,
                "auth_token": auth_token,
            })))
            .await?;
        ensure_success("identify", &resp)
    }

    pub async fn subscribe(&self, rooms: &[&str]) -> Result<()> {
        let resp = self
            .send(Request::new("subscribe").with_data(json!({"rooms": rooms})))
            .await?;
        ensure_success("subscribe", &resp)
    }

    pub async fn set_manager(&self, room: &str, manager_agent: &str) -> Result<()> {
        let resp = self
            .send(
                Request::new("set_manager")
                    .with_room(room)
                    .with_data(json!({"manager_agent": manager_agent})),
            )
            .await?;
        ensure_success("set_manager", &resp)
    }

    pub async fn join_room(&self, room: &str, agent_name: &str, role: &str) -> Result<Response> {
        self.send(
            Request::new("join_room")
                .with_room(room)
                .with_data(json!({"agent_name": agent_name, "role": role})),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        room: &str,
        from: &str,
        to: &str,
        content: &str,
        expects_reply: bool,
        priority: &str,
    ) -> Result<Response> {
        self.send(Request::new("send_message").with_room(room).with_data(json!({
            "from": from,
            "to": to,
            "content": content,
            "expects_reply": expects_reply,
            "priority": priority,
        })))
        .await
    }

    pub async fn get_messages(
        &self,
        room: &str,
        agent_name: &str,
        since_id: u64,
        limit: usize,
        unread_only: bool,
    ) -> Result<Response> {
        self.send(Request::new("get_messages").with_room(room).with_data(json!({
            "agent_name": agent_name,
            "since_id": since_id,
            "limit": limit,
            "unread_only": unread_only,
        })))
        .await
    }

    pub async fn get_all_messages(&self, room: &str, since_id: u64, limit: usize) -> Result<Response> {
        self.send(
            Request::new("get_all_messages")
                .with_room(room)
                .with_data(json!({"since_id": since_id, "limit": limit})),
        )
        .await
    }

    pub async fn list_agents(&self, room: &str, agent_name: &str) -> Result<Response> {
        self.send(
            Request::new("list_agents")
                .with_room(room)
                .with_data(json!({"agent_name": agent_name})),
        )
        .await
    }

    pub async fn leave_room(&self, room: &str, agent_name: &str) -> Result<Response> {
        self.send(
            Request::new("leave_room")
                .with_room(room)
                .with_data(json!({"agent_name": agent_name})),
        )
        .await
    }

    pub async fn clear_room(&self, room: &str) -> Result<Response> {
        self.send(Request::new("clear_room").with_room(room)).await
    }

    pub async fn get_last_message_id(&self, room: &str, agent_name: &str) -> Result<u64> {
        let resp = self
            .send(
                Request::new("get_last_message_id")
                    .with_room(room)
                    .with_data(json!({"agent_name": agent_name})),
            )
            .await?;
        ensure_success("get_last_message_id", &resp)?;
        Ok(resp
            .data
            .as_ref()
            .and_then(|d| d.get("last_id"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    pub async fn list_rooms(&self) -> Result<Response> {
        self.send(Request::new("list_rooms")).await
    }

    /// Structured roster for a room (desktop view).
    pub async fn get_agents_raw(&self, room: &str) -> Result<HashMap<String, AgentInfo>> {
        let resp = self.send(Request::new("get_agents").with_room(room)).await?;
        ensure_success("get_agents", &resp)?;
        let data = resp.data.unwrap_or_default();
        Ok(serde_json::from_value(
            data.get("agents").cloned().unwrap_or_default(),
        )?)
    }

    /// Structured message log for a room (desktop view).
    pub async fn get_messages_raw(&self, room: &str) -> Result<Vec<Message>> {
        let resp = self
            .send(Request::new("get_messages_raw").with_room(room))
            .await?;
        ensure_success("get_messages_raw", &resp)?;
        let data = resp.data.unwrap_or_default();
        Ok(serde_json::from_value(
            data.get("messages").cloned().unwrap_or_default(),
        )?)
    }
}

fn ensure_success(what: &str, resp: &Response) -> Result<()> {
    if resp.success {
        Ok(())
    } else {
        bail!(
            "{what} failed: {}",
            resp.error.as_deref().unwrap_or("unknown error")
        )
    }
}

/// One inbound frame, classified.
enum Inbound {
    Event(Event),
    Response(Response),
    Other,
}

fn classify_frame(text: &str) -> Inbound {
    let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) else {
        return Inbound::Other;
    };
    if raw.get("event").is_some() {
        if let Ok(event) = serde_json::from_value::<Event>(raw.clone()) {
            if event.kind == "event" {
                return Inbound::Event(event);
            }
        }
    }
    match serde_json::from_value::<Response>(raw) {
        Ok(resp) => Inbound::Response(resp),
        Err(_) => Inbound::Other,
    }
}

async fn read_loop(shared: Arc<Shared>, mut source: WsSource) {
    while let Some(frame) = source.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!("hub read error: {e}");
                break;
            }
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match classify_frame(&text) {
            Inbound::Event(event) => {
                let handler = shared
                    .on_event
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }
            Inbound::Response(resp) => {
                let waiter = shared
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&resp.id);
                if let Some(tx) = waiter {
                    let _ = tx.send(resp);
                }
            }
            Inbound::Other => {}
        }
    }

    // The connection is gone; make later sends fail fast.
    *shared.writer.lock().await = None;
    debug!("hub read loop exited");
}
