//! Request dispatch: every hub operation, its authorization rule, and the
//! prose rendering returned to tool callers.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ClientConn, Hub};
use crate::room::{list_room_infos, SendOptions};
use crate::types::{events, AgentInfo, Message, MessageType, Priority, Request, ALL};
use crate::validation::{sanitize, validate_field_len, validate_name};

fn default_true() -> bool {
    true
}

fn default_to() -> String {
    ALL.to_string()
}

fn default_read_limit() -> usize {
    10
}

fn default_all_limit() -> usize {
    15
}

#[derive(Deserialize, Default)]
struct IdentifyParams {
    #[serde(default)]
    client_type: String,
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    room: String,
    #[serde(default)]
    auth_token: String,
}

#[derive(Deserialize, Default)]
struct SubscribeParams {
    #[serde(default)]
    rooms: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SetManagerParams {
    #[serde(default)]
    manager_agent: String,
}

#[derive(Deserialize, Default)]
struct JoinParams {
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    role: String,
}

#[derive(Deserialize)]
struct SendParams {
    #[serde(default)]
    from: String,
    #[serde(default = "default_to")]
    to: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_true")]
    expects_reply: bool,
    #[serde(default)]
    priority: String,
}

#[derive(Deserialize)]
struct ReadParams {
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_read_limit")]
    limit: usize,
    #[serde(default = "default_true")]
    unread_only: bool,
}

#[derive(Deserialize)]
struct ReadAllParams {
    #[serde(default)]
    since_id: u64,
    #[serde(default = "default_all_limit")]
    limit: usize,
}

#[derive(Deserialize, Default)]
struct AgentNameParams {
    #[serde(default)]
    agent_name: String,
}

fn parse<T: Default + for<'de> Deserialize<'de>>(data: &Value) -> T {
    if data.is_null() {
        T::default()
    } else {
        serde_json::from_value(data.clone()).unwrap_or_default()
    }
}

fn parse_or<T: for<'de> Deserialize<'de>>(data: &Value, what: &str) -> Result<T, String> {
    let v = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data.clone()
    };
    serde_json::from_value(v).map_err(|_| format!("invalid {what} parameters"))
}

impl Hub {
    /// Validate and resolve the request's room name, reporting a violation
    /// on the correlated response.
    fn room_for(&self, client: &ClientConn, req: &Request) -> Option<String> {
        match self.resolve_room(&req.room) {
            Ok(room) => Some(room),
            Err(e) => {
                client.send_error(&req.id, &req.kind, e);
                None
            }
        }
    }

    /// Dispatch one request from a connection. Failures are reported on the
    /// correlated response; nothing here closes the connection.
    pub fn handle_request(&self, client: &Arc<ClientConn>, req: Request) {
        match req.kind.as_str() {
            "identify" => self.handle_identify(client, &req),
            "subscribe" => self.handle_subscribe(client, &req),
            "set_manager" => self.handle_set_manager(client, &req),
            "join_room" => self.handle_join_room(client, &req),
            "send_message" => self.handle_send_message(client, &req),
            "get_messages" => self.handle_get_messages(client, &req),
            "get_all_messages" => self.handle_get_all_messages(client, &req),
            "list_agents" => self.handle_list_agents(client, &req),
            "leave_room" => self.handle_leave_room(client, &req),
            "clear_room" => self.handle_clear_room(client, &req),
            "get_last_message_id" => self.handle_get_last_message_id(client, &req),
            "list_rooms" => self.handle_list_rooms(client, &req),
            "get_agents" => self.handle_get_agents(client, &req),
            "get_messages_raw" => self.handle_get_messages_raw(client, &req),
            other => client.send_error(&req.id, other, format!("unknown request type: {other}")),
        }
    }

    fn handle_identify(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: IdentifyParams = parse(&req.data);

        if let Err(e) = validate_name(&p.room) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }

        let desktop_ok = if p.client_type == "desktop" {
            match self.desktop_token() {
                Some(token) if p.auth_token != token => {
                    client.send_error(&req.id, &req.kind, "invalid desktop auth token");
                    return;
                }
                _ => true,
            }
        } else {
            false
        };

        client.set_identity(&p.client_type, &p.agent_name, desktop_ok);
        if !p.room.is_empty() {
            self.subscribe(client, &p.room);
        }

        info!(
            "client {} identified: type={} agent={:?}",
            client.id(),
            p.client_type,
            p.agent_name
        );
        client.send_ok(&req.id, &req.kind, json!({"ok": true}));
    }

    fn handle_subscribe(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: SubscribeParams = parse(&req.data);
        for room in &p.rooms {
            if let Err(e) = validate_name(room) {
                client.send_error(&req.id, &req.kind, e);
                return;
            }
        }
        for room in &p.rooms {
            self.subscribe(client, room);
        }
        debug!("client {} subscribed to {:?}", client.id(), p.rooms);
        client.send_ok(&req.id, &req.kind, json!({"ok": true}));
    }

    fn handle_set_manager(&self, client: &Arc<ClientConn>, req: &Request) {
        if !client.is_desktop() {
            client.send_error(&req.id, &req.kind, "set_manager requires desktop authentication");
            return;
        }
        let p: SetManagerParams = parse(&req.data);
        if let Err(e) = validate_name(&p.manager_agent) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }

        let Some(room) = self.room_for(client, req) else {
            return;
        };
        self.get_or_create_room(&room)
            .set_configured_manager(&p.manager_agent);

        info!("room {room:?}: configured manager set to {:?}", p.manager_agent);
        client.send_ok(&req.id, &req.kind, json!({"ok": true}));
    }

    fn handle_join_room(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: JoinParams = parse(&req.data);
        let Some(room) = self.room_for(client, req) else {
            return;
        };

        if p.agent_name.is_empty() {
            client.send_error(&req.id, &req.kind, "agent_name is required");
            return;
        }
        if let Err(e) = validate_name(&p.agent_name) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }
        let current = client.agent_name();
        if !current.is_empty() && current != p.agent_name {
            client.send_error(
                &req.id,
                &req.kind,
                format!("this connection already joined as '{current}'"),
            );
            return;
        }
        if let Err(e) = validate_field_len("role", &p.role) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }

        info!(
            "join_room: agent={:?} role={:?} room={room:?}",
            p.agent_name, p.role
        );

        let room_state = self.get_or_create_room(&room);
        let guard = room_state.fanout_guard();
        let (sys_msg, agents) = match room_state.join(&p.agent_name, &p.role) {
            Ok(v) => v,
            Err(e) => {
                drop(guard);
                client.send_error(&req.id, &req.kind, e.to_string());
                return;
            }
        };

        // Joining implies subscribing; a later leave_room does not undo it.
        self.subscribe(client, &room);
        client.set_joined(&p.agent_name, &room);

        self.broadcast_event(&room, events::MESSAGE_NEW, json!({"message": sys_msg}));
        self.broadcast_event(
            &room,
            events::AGENT_JOINED,
            json!({"agent_name": p.agent_name, "agents": agents}),
        );
        drop(guard);

        let mut others: Vec<&str> = agents
            .keys()
            .filter(|name| **name != p.agent_name)
            .map(String::as_str)
            .collect();
        others.sort_unstable();
        let text = if others.is_empty() {
            format!(
                "\u{2705} Joined room '{room}' as '{}'. No other agents are here yet.",
                p.agent_name
            )
        } else {
            format!(
                "\u{2705} Joined room '{room}' as '{}'. Also in the room: {}",
                p.agent_name,
                others.join(", ")
            )
        };

        client.send_ok(&req.id, &req.kind, json!({"text": text, "agents": agents}));
    }

    fn handle_send_message(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: SendParams = match parse_or(&req.data, "send_message") {
            Ok(p) => p,
            Err(e) => {
                client.send_error(&req.id, &req.kind, e);
                return;
            }
        };
        let Some(room) = self.room_for(client, req) else {
            return;
        };

        let joined_room = client.joined_room();
        let agent_name = client.agent_name();
        if joined_room.is_empty() || agent_name.is_empty() {
            client.send_error(&req.id, &req.kind, "join_room must be called first");
            return;
        }
        if joined_room != room {
            client.send_error(
                &req.id,
                &req.kind,
                format!("messages can only be sent in the joined room: {joined_room}"),
            );
            return;
        }
        if let Err(e) = validate_name(&p.from) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }
        if p.from != agent_name {
            client.send_error(&req.id, &req.kind, "'from' must be your own agent name");
            return;
        }
        if p.to != ALL {
            if let Err(e) = validate_name(&p.to) {
                client.send_error(&req.id, &req.kind, e);
                return;
            }
        }
        if let Err(e) = validate_field_len("content", &p.content) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }
        let Some(priority) = Priority::parse(&p.priority) else {
            client.send_error(
                &req.id,
                &req.kind,
                format!("invalid priority {:?}: expected urgent, normal or low", p.priority),
            );
            return;
        };

        let room_state = self.get_or_create_room(&room);

        let active_manager = room_state.active_manager();
        if !active_manager.is_empty() && p.from == active_manager {
            room_state.touch_manager_heartbeat(&p.from);
        }

        // Manager interception: with an active manager, everyone else's
        // messages are rerouted to the manager. The manager talks freely.
        let mut to = p.to.clone();
        let mut opts = SendOptions::default();
        let intercepted = !active_manager.is_empty() && p.from != active_manager;
        if intercepted {
            opts.original_to = p.to.clone();
            opts.routed_by_manager = true;
            to = active_manager.clone();
        }

        let guard = room_state.fanout_guard();
        let msg = room_state.send_message(&p.from, &to, &p.content, p.expects_reply, priority, opts);
        self.broadcast_event(&room, events::MESSAGE_NEW, json!({"message": msg}));
        drop(guard);

        debug!(
            "send_message: id={} from={:?} to={:?} room={room:?} intercepted={intercepted}",
            msg.id, p.from, to
        );

        let text = if intercepted {
            format!(
                "\u{1f4e4} Message routed to manager '{active_manager}' for review (ID: {})",
                msg.id
            )
        } else if p.to == ALL {
            format!("\u{1f4e4} Message broadcast to all agents (ID: {})", msg.id)
        } else {
            format!("\u{1f4e4} Message sent to '{}' (ID: {})", p.to, msg.id)
        };

        client.send_ok(&req.id, &req.kind, json!({"text": text, "message_id": msg.id}));
    }

    fn handle_get_messages(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: ReadParams = match parse_or(&req.data, "get_messages") {
            Ok(p) => p,
            Err(e) => {
                client.send_error(&req.id, &req.kind, e);
                return;
            }
        };
        let Some(room) = self.room_for(client, req) else {
            return;
        };

        if let Err(e) = validate_name(&p.agent_name) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }
        let joined_here = client.joined_room() == room && client.agent_name() == p.agent_name;
        if !client.is_desktop() && !joined_here {
            client.send_error(&req.id, &req.kind, "join_room must be called first");
            return;
        }

        let room_state = self.get_or_create_room(&room);
        let caller = client.agent_name();
        if !caller.is_empty() {
            room_state.touch_manager_heartbeat(&caller);
        }
        let (messages, total) = room_state.read_messages(&p.agent_name, p.since_id, p.limit, p.unread_only);

        if messages.is_empty() {
            client.send_ok(&req.id, &req.kind, json!({"text": "\u{1f4ed} No new messages."}));
            return;
        }

        let mut text = if p.limit > 0 && total > p.limit {
            format!("\u{1f4ec} Latest {} messages (of {total}):\n\n", p.limit)
        } else {
            format!("\u{1f4ec} {} messages:\n\n", messages.len())
        };
        for msg in &messages {
            let ts = crate::types::clock_time(&msg.timestamp);
            match msg.kind {
                MessageType::System => {
                    let _ = writeln!(text, "[{ts}] {}", sanitize(&msg.content));
                }
                _ if msg.to == ALL => {
                    let _ = writeln!(
                        text,
                        "[{ts}] {} \u{2192} EVERYONE: {}",
                        sanitize(&msg.from),
                        sanitize(&msg.content)
                    );
                }
                _ if !msg.original_to.is_empty() && msg.original_to != msg.to => {
                    let _ = writeln!(
                        text,
                        "[{ts}] {} \u{2192} {} (originally for {}): {}",
                        sanitize(&msg.from),
                        sanitize(&msg.to),
                        sanitize(&msg.original_to),
                        sanitize(&msg.content)
                    );
                }
                _ => {
                    let _ = writeln!(
                        text,
                        "[{ts}] {} \u{2192} {}: {}",
                        sanitize(&msg.from),
                        sanitize(&msg.to),
                        sanitize(&msg.content)
                    );
                }
            }
            let _ = writeln!(text, "  (ID: {})\n", msg.id);
        }

        client.send_ok(&req.id, &req.kind, json!({"text": text}));
    }

    fn handle_get_all_messages(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: ReadAllParams = match parse_or(&req.data, "get_all_messages") {
            Ok(p) => p,
            Err(e) => {
                client.send_error(&req.id, &req.kind, e);
                return;
            }
        };
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let room_state = self.get_or_create_room(&room);

        let caller = client.agent_name();
        let is_active_manager = !caller.is_empty() && room_state.active_manager() == caller;
        if !client.is_desktop() && !is_active_manager {
            client.send_error(
                &req.id,
                &req.kind,
                "get_all_messages requires the active manager or the desktop",
            );
            return;
        }
        if is_active_manager {
            room_state.touch_manager_heartbeat(&caller);
        }

        let (messages, total) = room_state.read_all_messages(p.since_id, p.limit);
        if messages.is_empty() {
            client.send_ok(&req.id, &req.kind, json!({"text": "\u{1f4ed} No new messages."}));
            return;
        }

        let mut text = if p.limit > 0 && total > p.limit {
            format!("\u{1f4ec} Latest {} messages (of {total}):\n\n", p.limit)
        } else {
            format!("\u{1f4ec} {} messages (all):\n\n", messages.len())
        };
        for msg in &messages {
            let ts = crate::types::clock_time(&msg.timestamp);
            if msg.kind == MessageType::System {
                let _ = writeln!(text, "[{ts}] SYSTEM: {}", sanitize(&msg.content));
            } else {
                let preview = preview_bytes(&msg.content, 100);
                if !msg.original_to.is_empty() && msg.original_to != msg.to {
                    let _ = writeln!(
                        text,
                        "[{ts}] #{} {} \u{2192} {} (originally for {}): {}",
                        msg.id,
                        sanitize(&msg.from),
                        sanitize(&msg.to),
                        sanitize(&msg.original_to),
                        sanitize(&preview)
                    );
                } else {
                    let _ = writeln!(
                        text,
                        "[{ts}] #{} {} \u{2192} {}: {}",
                        msg.id,
                        sanitize(&msg.from),
                        sanitize(&msg.to),
                        sanitize(&preview)
                    );
                }
            }
            text.push('\n');
        }

        client.send_ok(&req.id, &req.kind, json!({"text": text}));
    }

    fn handle_list_agents(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: AgentNameParams = parse(&req.data);
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let room_state = self.get_or_create_room(&room);

        let caller = client.agent_name();
        if !caller.is_empty() {
            room_state.touch_manager_heartbeat(&caller);
        }
        let agents = room_state.list_agents(&p.agent_name);

        if agents.is_empty() {
            client.send_ok(&req.id, &req.kind, json!({"text": "\u{1f465} The room is empty."}));
            return;
        }

        let mut names: Vec<&String> = agents.keys().collect();
        names.sort_unstable();
        let mut text = format!(
            "\u{1f465} Agents in room '{}' ({}):\n\n",
            sanitize(&room),
            agents.len()
        );
        for name in names {
            let info = &agents[name];
            let marker = if *name == p.agent_name { " (you)" } else { "" };
            let _ = write!(text, "  \u{2022} {}{marker}", sanitize(name));
            if !info.role.is_empty() {
                let _ = write!(text, " - {}", sanitize(&info.role));
            }
            let joined = info.joined_at.split('T').next().unwrap_or("");
            let _ = writeln!(text, "\n    joined: {joined}");
        }

        client.send_ok(&req.id, &req.kind, json!({"text": text}));
    }

    fn handle_leave_room(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: AgentNameParams = parse(&req.data);
        let Some(room) = self.room_for(client, req) else {
            return;
        };

        if let Err(e) = validate_name(&p.agent_name) {
            client.send_error(&req.id, &req.kind, e);
            return;
        }
        let agent_name = client.agent_name();
        let joined_room = client.joined_room();
        if agent_name.is_empty() || joined_room.is_empty() {
            client.send_error(&req.id, &req.kind, "join_room must be called first");
            return;
        }
        if p.agent_name != agent_name {
            client.send_error(&req.id, &req.kind, "leave_room only works with your own agent name");
            return;
        }
        if joined_room != room {
            client.send_error(
                &req.id,
                &req.kind,
                format!("you can only leave the room you joined: {joined_room}"),
            );
            return;
        }

        let room_state = self.get_or_create_room(&room);
        let guard = room_state.fanout_guard();
        let Some(sys_msg) = room_state.leave(&p.agent_name) else {
            drop(guard);
            client.send_ok(
                &req.id,
                &req.kind,
                json!({"text": format!("\u{26a0}\u{fe0f} '{}' is not in the room.", p.agent_name)}),
            );
            return;
        };

        let agents = room_state.agents_snapshot();
        self.broadcast_event(&room, events::MESSAGE_NEW, json!({"message": sys_msg}));
        self.broadcast_event(
            &room,
            events::AGENT_LEFT,
            json!({"agent_name": p.agent_name, "agents": agents}),
        );
        drop(guard);

        client.clear_joined();
        client.send_ok(
            &req.id,
            &req.kind,
            json!({"text": format!("\u{1f44b} '{}' left the room.", p.agent_name)}),
        );
    }

    fn handle_clear_room(&self, client: &Arc<ClientConn>, req: &Request) {
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let room_state = self.get_or_create_room(&room);

        let caller = client.agent_name();
        let is_active_manager = !caller.is_empty() && room_state.active_manager() == caller;
        if !client.is_desktop() && !is_active_manager {
            client.send_error(
                &req.id,
                &req.kind,
                "clear_room requires the active manager or the desktop",
            );
            return;
        }

        let guard = room_state.fanout_guard();
        room_state.clear();
        self.broadcast_event(&room, events::ROOM_CLEARED, json!({}));
        drop(guard);

        info!("room {room:?} cleared by client {}", client.id());
        client.send_ok(
            &req.id,
            &req.kind,
            json!({"text": format!("\u{1f9f9} Room '{room}' cleared. All messages and agent records removed.")}),
        );
    }

    fn handle_get_last_message_id(&self, client: &Arc<ClientConn>, req: &Request) {
        let p: AgentNameParams = parse(&req.data);
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let room_state = self.get_or_create_room(&room);

        let caller = client.agent_name();
        if !caller.is_empty() {
            room_state.touch_manager_heartbeat(&caller);
        }
        let last_id = room_state.last_message_id(&p.agent_name);

        client.send_ok(&req.id, &req.kind, json!({"last_id": last_id}));
    }

    fn handle_list_rooms(&self, client: &Arc<ClientConn>, req: &Request) {
        let rooms = self.rooms();
        let snapshot: Vec<(String, Arc<crate::room::RoomState>)> = rooms
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let infos = list_room_infos(snapshot.iter().map(|(n, r)| (n, r.as_ref())));

        if infos.is_empty() {
            client.send_ok(&req.id, &req.kind, json!({"text": "\u{1f4ad} No rooms yet.", "rooms": []}));
            return;
        }

        let mut text = format!("\u{1f3e0} Active rooms ({}):\n\n", infos.len());
        for info in &infos {
            let marker = if info.name == self.default_room() {
                " (default)"
            } else {
                ""
            };
            let _ = writeln!(
                text,
                "  \u{2022} {}{marker} - {} agents, {} messages",
                info.name, info.agents, info.messages
            );
        }

        let rooms_json: Vec<Value> = infos
            .iter()
            .map(|i| json!({"name": i.name, "agents": i.agents, "messages": i.messages}))
            .collect();
        client.send_ok(&req.id, &req.kind, json!({"text": text, "rooms": rooms_json}));
    }

    fn handle_get_agents(&self, client: &Arc<ClientConn>, req: &Request) {
        if !client.is_desktop() {
            client.send_error(&req.id, &req.kind, "get_agents requires desktop authentication");
            return;
        }
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let agents: HashMap<String, AgentInfo> = self.get_or_create_room(&room).agents_snapshot();
        client.send_ok(&req.id, &req.kind, json!({"agents": agents}));
    }

    fn handle_get_messages_raw(&self, client: &Arc<ClientConn>, req: &Request) {
        if !client.is_desktop() {
            client.send_error(&req.id, &req.kind, "get_messages_raw requires desktop authentication");
            return;
        }
        let Some(room) = self.room_for(client, req) else {
            return;
        };
        let messages: Vec<Message> = self.get_or_create_room(&room).messages_snapshot();
        client.send_ok(&req.id, &req.kind, json!({"messages": messages}));
    }
}

/// First `max` bytes of `s`, respecting char boundaries.
fn preview_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Response};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct TestClient {
        conn: Arc<ClientConn>,
        rx: mpsc::Receiver<String>,
    }

    fn test_hub() -> Arc<Hub> {
        Arc::new(Hub::new("/nonexistent", "default", None))
    }

    fn hub_with_token(token: &str) -> Arc<Hub> {
        Arc::new(Hub::new("/nonexistent", "default", Some(token.to_string())))
    }

    fn connect(hub: &Arc<Hub>) -> TestClient {
        let (tx, rx) = mpsc::channel(64);
        let conn = hub.register_client(tx);
        TestClient { conn, rx }
    }

    impl TestClient {
        /// Next Response frame, skipping interleaved events.
        fn response(&mut self, request_type: &str) -> Response {
            while let Ok(frame) = self.rx.try_recv() {
                if let Ok(resp) = serde_json::from_str::<Response>(&frame) {
                    if !resp.request_type.is_empty() && resp.request_type == request_type {
                        return resp;
                    }
                }
            }
            panic!("no response for {request_type}");
        }

        fn events(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Ok(ev) = serde_json::from_str::<Event>(&frame) {
                    if ev.kind == "event" {
                        out.push(ev);
                    }
                }
            }
            out
        }
    }

    fn request(kind: &str, room: &str, data: Value) -> Request {
        Request {
            id: "1".into(),
            kind: kind.into(),
            room: room.into(),
            data,
        }
    }

    fn join(hub: &Arc<Hub>, c: &mut TestClient, room: &str, agent: &str, role: &str) {
        hub.handle_request(
            &c.conn,
            request("join_room", room, json!({"agent_name": agent, "role": role})),
        );
        let resp = c.response("join_room");
        assert!(resp.success, "join failed: {:?}", resp.error);
    }

    #[test]
    fn send_before_join_rejected() {
        let hub = test_hub();
        let mut c = connect(&hub);
        hub.handle_request(
            &c.conn,
            request("send_message", "r1", json!({"from": "alice", "to": "bob", "content": "hi"})),
        );
        let resp = c.response("send_message");
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("join_room"));
    }

    #[test]
    fn join_then_send_round_trip() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "developer");

        hub.handle_request(
            &c.conn,
            request("send_message", "r1", json!({"from": "alice", "to": "all", "content": "hi"})),
        );

        // The message_new event is enqueued before the response on the same
        // queue.
        let frame = c.rx.try_recv().unwrap();
        let ev: Event = serde_json::from_str(&frame).unwrap();
        assert_eq!(ev.event, "message_new");
        let msg: Message = serde_json::from_value(ev.data["message"].clone()).unwrap();
        assert_eq!(msg.id, 2);
        assert_eq!(msg.kind, MessageType::Broadcast);

        let resp = c.response("send_message");
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["message_id"], 2);
    }

    #[test]
    fn impersonation_rejected() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");

        hub.handle_request(
            &c.conn,
            request("send_message", "r1", json!({"from": "mallory", "to": "all", "content": "x"})),
        );
        let resp = c.response("send_message");
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("own agent name"));
        // No message was stored beyond the join system message.
        assert_eq!(hub.get_or_create_room("r1").last_message_id(""), 1);
    }

    #[test]
    fn send_outside_joined_room_rejected() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");
        hub.handle_request(
            &c.conn,
            request("send_message", "r2", json!({"from": "alice", "content": "x"})),
        );
        assert!(!c.response("send_message").success);
    }

    #[test]
    fn manager_interception_rewrites_target() {
        let hub = test_hub();
        hub.get_or_create_room("r1").set_configured_manager("manager");

        let mut mgr = connect(&hub);
        join(&hub, &mut mgr, "r1", "manager", "manager");

        let mut alice = connect(&hub);
        join(&hub, &mut alice, "r1", "alice", "developer");

        hub.handle_request(
            &alice.conn,
            request("send_message", "r1", json!({"from": "alice", "to": "bob", "content": "hi"})),
        );
        let resp = alice.response("send_message");
        assert!(resp.success);
        assert!(resp.data.unwrap()["text"].as_str().unwrap().contains("manager"));

        let last = hub.get_or_create_room("r1").messages_snapshot().pop().unwrap();
        assert_eq!(last.to, "manager");
        assert_eq!(last.original_to, "bob");
        assert!(last.routed_by_manager);
    }

    #[test]
    fn manager_own_messages_not_intercepted() {
        let hub = test_hub();
        hub.get_or_create_room("r1").set_configured_manager("manager");

        let mut mgr = connect(&hub);
        join(&hub, &mut mgr, "r1", "manager", "manager");

        hub.handle_request(
            &mgr.conn,
            request("send_message", "r1", json!({"from": "manager", "to": "alice", "content": "do X"})),
        );
        assert!(mgr.response("send_message").success);

        let last = hub.get_or_create_room("r1").messages_snapshot().pop().unwrap();
        assert_eq!(last.to, "alice");
        assert_eq!(last.original_to, "");
        assert!(!last.routed_by_manager);
    }

    #[test]
    fn manager_join_requires_configuration() {
        let hub = test_hub();
        let mut c = connect(&hub);
        hub.handle_request(
            &c.conn,
            request("join_room", "r1", json!({"agent_name": "boss", "role": "manager"})),
        );
        assert!(!c.response("join_room").success);

        hub.get_or_create_room("r1").set_configured_manager("boss");
        let mut c2 = connect(&hub);
        join(&hub, &mut c2, "r1", "boss", "manager");
        assert_eq!(hub.get_or_create_room("r1").active_manager(), "boss");
    }

    #[test]
    fn desktop_identify_requires_token() {
        let hub = hub_with_token("secret");
        let mut c = connect(&hub);

        hub.handle_request(&c.conn, request("identify", "", json!({"client_type": "desktop"})));
        assert!(!c.response("identify").success);

        hub.handle_request(
            &c.conn,
            request("identify", "", json!({"client_type": "desktop", "auth_token": "wrong"})),
        );
        assert!(!c.response("identify").success);

        hub.handle_request(
            &c.conn,
            request("identify", "", json!({"client_type": "desktop", "auth_token": "secret"})),
        );
        assert!(c.response("identify").success);
        assert!(c.conn.is_desktop());
    }

    #[test]
    fn set_manager_requires_desktop() {
        let hub = hub_with_token("secret");
        let mut guest = connect(&hub);
        hub.handle_request(
            &guest.conn,
            request("set_manager", "r1", json!({"manager_agent": "boss"})),
        );
        assert!(!guest.response("set_manager").success);

        let mut desktop = connect(&hub);
        hub.handle_request(
            &desktop.conn,
            request("identify", "", json!({"client_type": "desktop", "auth_token": "secret"})),
        );
        assert!(desktop.response("identify").success);

        hub.handle_request(
            &desktop.conn,
            request("set_manager", "r1", json!({"manager_agent": "boss"})),
        );
        assert!(desktop.response("set_manager").success);
        assert_eq!(hub.get_or_create_room("r1").configured_manager(), "boss");
    }

    #[test]
    fn get_all_messages_denied_for_plain_agents() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "developer");

        hub.handle_request(
            &c.conn,
            request("get_all_messages", "r1", json!({"since_id": 0, "limit": 10})),
        );
        assert!(!c.response("get_all_messages").success);
    }

    #[test]
    fn clear_room_requires_desktop_or_manager() {
        let hub = test_hub();
        hub.get_or_create_room("r1").set_configured_manager("boss");

        let mut alice = connect(&hub);
        join(&hub, &mut alice, "r1", "alice", "developer");
        hub.handle_request(&alice.conn, request("clear_room", "r1", Value::Null));
        assert!(!alice.response("clear_room").success);

        let mut boss = connect(&hub);
        join(&hub, &mut boss, "r1", "boss", "manager");
        hub.handle_request(&boss.conn, request("clear_room", "r1", Value::Null));
        assert!(boss.response("clear_room").success);

        let room = hub.get_or_create_room("r1");
        assert_eq!(room.messages_snapshot().len(), 0);
        assert!(room.agents_snapshot().is_empty());
    }

    #[test]
    fn raw_endpoints_require_desktop() {
        let hub = hub_with_token("secret");
        let mut guest = connect(&hub);
        hub.handle_request(&guest.conn, request("get_messages_raw", "r1", Value::Null));
        assert!(!guest.response("get_messages_raw").success);
        hub.handle_request(&guest.conn, request("get_agents", "r1", Value::Null));
        assert!(!guest.response("get_agents").success);

        let mut desktop = connect(&hub);
        hub.handle_request(
            &desktop.conn,
            request("identify", "", json!({"client_type": "desktop", "auth_token": "secret"})),
        );
        assert!(desktop.response("identify").success);
        hub.handle_request(&desktop.conn, request("get_messages_raw", "r1", Value::Null));
        assert!(desktop.response("get_messages_raw").success);
        hub.handle_request(&desktop.conn, request("get_agents", "r1", Value::Null));
        assert!(desktop.response("get_agents").success);
    }

    #[test]
    fn get_messages_requires_membership() {
        let hub = test_hub();
        let mut c = connect(&hub);
        hub.handle_request(
            &c.conn,
            request("get_messages", "r1", json!({"agent_name": "alice"})),
        );
        assert!(!c.response("get_messages").success);

        join(&hub, &mut c, "r1", "alice", "");
        hub.handle_request(
            &c.conn,
            request("get_messages", "r1", json!({"agent_name": "alice"})),
        );
        let resp = c.response("get_messages");
        assert!(resp.success);
        assert!(resp.text().unwrap().contains("joined the room"));
    }

    #[test]
    fn join_broadcasts_to_subscribers() {
        let hub = test_hub();
        let mut watcher = connect(&hub);
        hub.handle_request(
            &watcher.conn,
            request("subscribe", "", json!({"rooms": ["r1"]})),
        );
        assert!(watcher.response("subscribe").success);

        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");

        let events: Vec<String> = watcher.events().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["message_new", "agent_joined"]);
    }

    #[test]
    fn leave_room_keeps_subscription() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");
        hub.handle_request(
            &c.conn,
            request("leave_room", "r1", json!({"agent_name": "alice"})),
        );
        // Drain: message_new + agent_left events, then the response.
        let evs = c.events();
        assert!(evs.iter().any(|e| e.event == "agent_left"));

        // Still subscribed: another agent joining is observed.
        let mut c2 = connect(&hub);
        join(&hub, &mut c2, "r1", "bob", "");
        assert!(c.events().iter().any(|e| e.event == "agent_joined"));
    }

    #[test]
    fn get_last_message_id_counts() {
        let hub = test_hub();
        let mut c = connect(&hub);
        hub.handle_request(&c.conn, request("get_last_message_id", "r1", Value::Null));
        let resp = c.response("get_last_message_id");
        assert_eq!(resp.data.unwrap()["last_id"], 0);

        join(&hub, &mut c, "r1", "alice", "");
        hub.handle_request(&c.conn, request("get_last_message_id", "r1", Value::Null));
        let resp = c.response("get_last_message_id");
        assert_eq!(resp.data.unwrap()["last_id"], 1);
    }

    #[test]
    fn list_rooms_reports_counts() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "beta", "alice", "");
        hub.handle_request(&c.conn, request("list_rooms", "", Value::Null));
        let resp = c.response("list_rooms");
        let data = resp.data.unwrap();
        assert_eq!(data["rooms"][0]["name"], "beta");
        assert_eq!(data["rooms"][0]["agents"], 1);
        assert_eq!(data["rooms"][0]["messages"], 1);
    }

    #[test]
    fn unknown_request_type_errors() {
        let hub = test_hub();
        let mut c = connect(&hub);
        hub.handle_request(&c.conn, request("frobnicate", "", Value::Null));
        let resp = c.response("frobnicate");
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("unknown request type"));
    }

    #[test]
    fn oversized_content_rejected() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");
        let big = "x".repeat(crate::validation::MAX_FIELD_LEN + 1);
        hub.handle_request(
            &c.conn,
            request("send_message", "r1", json!({"from": "alice", "content": big})),
        );
        assert!(!c.response("send_message").success);
    }

    #[test]
    fn invalid_priority_rejected() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "r1", "alice", "");
        hub.handle_request(
            &c.conn,
            request(
                "send_message",
                "r1",
                json!({"from": "alice", "content": "x", "priority": "asap"}),
            ),
        );
        assert!(!c.response("send_message").success);
    }

    #[test]
    fn invalid_room_names_rejected_everywhere() {
        let hub = test_hub();
        let mut c = connect(&hub);

        // Path traversal in a room name must never reach the room registry
        // (its name becomes a snapshot path under hub-state/).
        hub.handle_request(
            &c.conn,
            request("join_room", "../../tmp/evil", json!({"agent_name": "alice"})),
        );
        assert!(!c.response("join_room").success);

        hub.handle_request(&c.conn, request("clear_room", "a..b", Value::Null));
        assert!(!c.response("clear_room").success);

        hub.handle_request(
            &c.conn,
            request("subscribe", "", json!({"rooms": ["ok-room", "bad/room"]})),
        );
        assert!(!c.response("subscribe").success);

        hub.handle_request(
            &c.conn,
            request("identify", "", json!({"client_type": "mcp", "room": "evil\u{e9}"})),
        );
        assert!(!c.response("identify").success);

        assert!(hub.rooms().is_empty());
        assert!(c.conn.subscribed_rooms().is_empty());
    }

    #[test]
    fn default_room_used_when_empty() {
        let hub = test_hub();
        let mut c = connect(&hub);
        join(&hub, &mut c, "", "alice", "");
        assert_eq!(c.conn.joined_room(), "default");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let s = "ééééé"; // 2 bytes per char
        let p = preview_bytes(s, 5);
        assert_eq!(p, "éé");
        assert_eq!(preview_bytes("short", 100), "short");
    }
}
