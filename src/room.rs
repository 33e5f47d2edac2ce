//! Per-room in-memory state: ordered messages, roster, manager lock.
//!
//! Every public operation takes the room lock for its whole duration, so the
//! invariants (monotonic IDs, single manager, bounded message window) hold
//! between any two calls. Callers only ever receive copies of internal data.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{self, AgentInfo, Message, MessageType, Priority, ALL, SYSTEM};

/// Hard cap on stored messages per room.
pub const MAX_MESSAGES: usize = 500;
/// Window retained after the cap is exceeded.
pub const TRUNCATE_TO: usize = 300;
/// Seconds of inactivity before an agent is garbage-collected.
pub const STALE_TIMEOUT_SECS: f64 = 300.0;
/// Seconds without a heartbeat before the manager lock expires.
pub const MANAGER_TIMEOUT_SECS: f64 = 300.0;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("agent name '{0}' is already taken in this room")]
    DuplicateAgent(String),
    #[error("room already has an active manager: {0}")]
    ManagerActive(String),
    #[error("'{0}' is not the configured manager for this room")]
    ManagerNotConfigured(String),
}

/// JSON-serializable snapshot of a room, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRoom {
    pub messages: Vec<Message>,
    pub agents: HashMap<String, AgentInfo>,
}

/// Optional routing metadata attached by manager interception.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub original_to: String,
    pub routed_by_manager: bool,
}

/// Name, agent count and message count, for room listings.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub name: String,
    pub agents: usize,
    pub messages: usize,
}

#[derive(Default)]
struct RoomInner {
    messages: Vec<Message>,
    agents: HashMap<String, AgentInfo>,
    configured_manager: String,
    manager_agent: String,
    manager_last_seen: f64,
    dirty: bool,
}

/// In-memory state of a single chat room.
#[derive(Default)]
pub struct RoomState {
    inner: RwLock<RoomInner>,
    /// Serializes mutation + event fan-out so subscribers observe events in
    /// message-ID order. Held by the hub around mutating operations.
    fanout: Mutex<()>,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard for hub operations that must broadcast in mutation order.
    pub fn fanout_guard(&self) -> MutexGuard<'_, ()> {
        self.fanout.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an agent to the room. Returns the system join message and a
    /// snapshot of the roster after the join.
    ///
    /// A `role` of "manager" (case-insensitive) claims the manager lock,
    /// which requires the room's configured manager to match `agent_name`
    /// and no other manager to be active.
    pub fn join(
        &self,
        agent_name: &str,
        role: &str,
    ) -> Result<(Message, HashMap<String, AgentInfo>), RoomError> {
        let mut r = self.write();
        cleanup_stale(&mut r);

        if r.agents.contains_key(agent_name) {
            return Err(RoomError::DuplicateAgent(agent_name.to_string()));
        }

        if role.trim().eq_ignore_ascii_case("manager") {
            if r.configured_manager != agent_name {
                return Err(RoomError::ManagerNotConfigured(agent_name.to_string()));
            }
            let active = active_manager(&mut r);
            if !active.is_empty() && active != agent_name {
                return Err(RoomError::ManagerActive(active));
            }
            r.manager_agent = agent_name.to_string();
            r.manager_last_seen = types::now();
        }

        r.agents.insert(
            agent_name.to_string(),
            AgentInfo {
                role: role.to_string(),
                joined_at: types::timestamp(),
                last_seen: types::now(),
            },
        );

        let mut content = format!("\u{1f7e2} {agent_name} joined the room");
        if !role.is_empty() {
            content.push_str(&format!(" (role: {role})"));
        }
        let sys_msg = push_system(&mut r, content);
        r.dirty = true;

        Ok((sys_msg, r.agents.clone()))
    }

    /// Append a message, applying the retention window.
    pub fn send_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        expects_reply: bool,
        priority: Priority,
        opts: SendOptions,
    ) -> Message {
        let mut r = self.write();

        if let Some(agent) = r.agents.get_mut(from) {
            agent.last_seen = types::now();
        }

        let kind = if to == ALL {
            MessageType::Broadcast
        } else {
            MessageType::Direct
        };

        let msg = Message {
            id: next_id(&r),
            from: from.to_string(),
            to: to.to_string(),
            original_to: opts.original_to,
            content: content.to_string(),
            timestamp: types::timestamp(),
            kind,
            routed_by_manager: opts.routed_by_manager,
            expects_reply,
            priority,
        };
        r.messages.push(msg.clone());

        if r.messages.len() > MAX_MESSAGES {
            let cut = r.messages.len() - TRUNCATE_TO;
            r.messages.drain(..cut);
        }

        r.dirty = true;
        msg
    }

    /// Messages visible to `agent_name` after `since_id`: addressed to the
    /// agent or to everyone, plus system messages. With `unread_only`, the
    /// agent's own messages are excluded. Returns the `limit` most recent
    /// matches and the total match count.
    pub fn read_messages(
        &self,
        agent_name: &str,
        since_id: u64,
        limit: usize,
        unread_only: bool,
    ) -> (Vec<Message>, usize) {
        let mut r = self.write();

        if let Some(agent) = r.agents.get_mut(agent_name) {
            agent.last_seen = types::now();
            r.dirty = true;
        }

        let filtered: Vec<Message> = r
            .messages
            .iter()
            .filter(|m| m.id > since_id)
            .filter(|m| !(unread_only && m.from == agent_name))
            .filter(|m| m.to == ALL || m.to == agent_name || m.kind == MessageType::System)
            .cloned()
            .collect();

        clamp_recent(filtered, limit)
    }

    /// All messages after `since_id`, unfiltered (manager/desktop view).
    pub fn read_all_messages(&self, since_id: u64, limit: usize) -> (Vec<Message>, usize) {
        let r = self.read();
        let filtered: Vec<Message> = r
            .messages
            .iter()
            .filter(|m| m.id > since_id)
            .cloned()
            .collect();
        clamp_recent(filtered, limit)
    }

    /// Roster snapshot after a staleness sweep. A non-empty `agent_name`
    /// refreshes that agent's `last_seen`.
    pub fn list_agents(&self, agent_name: &str) -> HashMap<String, AgentInfo> {
        let mut r = self.write();
        cleanup_stale(&mut r);

        if !agent_name.is_empty() {
            if let Some(agent) = r.agents.get_mut(agent_name) {
                agent.last_seen = types::now();
                r.dirty = true;
            }
        }

        r.agents.clone()
    }

    /// Remove an agent. Returns the system message, or `None` if the agent
    /// was not in the room.
    pub fn leave(&self, agent_name: &str) -> Option<Message> {
        let mut r = self.write();

        r.agents.remove(agent_name)?;
        if r.manager_agent == agent_name {
            r.manager_agent.clear();
            r.manager_last_seen = 0.0;
        }

        let sys_msg = push_system(&mut r, format!("\u{1f534} {agent_name} left the room"));
        r.dirty = true;
        Some(sys_msg)
    }

    /// Drop all messages, agents and the manager lock.
    pub fn clear(&self) {
        let mut r = self.write();
        r.messages.clear();
        r.agents.clear();
        r.manager_agent.clear();
        r.manager_last_seen = 0.0;
        r.dirty = true;
    }

    /// The active manager's name, expiring a stale lock first. Empty when
    /// no manager is active.
    pub fn active_manager(&self) -> String {
        let mut r = self.write();
        active_manager(&mut r)
    }

    /// Refresh the manager heartbeat if `agent_name` holds the lock.
    pub fn touch_manager_heartbeat(&self, agent_name: &str) -> bool {
        let mut r = self.write();
        if active_manager(&mut r) == agent_name {
            r.manager_last_seen = types::now();
            true
        } else {
            false
        }
    }

    /// Record the supervisor-configured manager name. Empty clears it. A
    /// changed configuration invalidates a lock held under the old name.
    pub fn set_configured_manager(&self, name: &str) {
        let mut r = self.write();
        r.configured_manager = name.to_string();
        if r.manager_agent != name {
            r.manager_agent.clear();
            r.manager_last_seen = 0.0;
        }
        r.dirty = true;
    }

    pub fn configured_manager(&self) -> String {
        self.read().configured_manager.clone()
    }

    /// Highest assigned message ID, 0 for an empty room. A non-empty
    /// `agent_name` refreshes that agent's `last_seen`.
    pub fn last_message_id(&self, agent_name: &str) -> u64 {
        let mut r = self.write();
        if !agent_name.is_empty() {
            if let Some(agent) = r.agents.get_mut(agent_name) {
                agent.last_seen = types::now();
                r.dirty = true;
            }
        }
        r.messages.last().map(|m| m.id).unwrap_or(0)
    }

    /// Roster snapshot without a staleness sweep (desktop raw view).
    pub fn agents_snapshot(&self) -> HashMap<String, AgentInfo> {
        self.read().agents.clone()
    }

    /// Copy of all stored messages (desktop raw view).
    pub fn messages_snapshot(&self) -> Vec<Message> {
        self.read().messages.clone()
    }

    /// State to persist.
    pub fn snapshot(&self) -> PersistedRoom {
        let r = self.read();
        PersistedRoom {
            messages: r.messages.clone(),
            agents: r.agents.clone(),
        }
    }

    /// Replace state from a persisted snapshot (startup load).
    pub fn restore(&self, snapshot: PersistedRoom) {
        let mut r = self.write();
        r.messages = snapshot.messages;
        r.agents = snapshot.agents;
    }

    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub fn mark_clean(&self) {
        self.write().dirty = false;
    }

    /// Agent and message counts for listings.
    pub fn info(&self) -> (usize, usize) {
        let r = self.read();
        (r.agents.len(), r.messages.len())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RoomInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RoomInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn age_manager(&self, secs: f64) {
        self.write().manager_last_seen -= secs;
    }

    #[cfg(test)]
    fn age_agent(&self, name: &str, secs: f64) {
        if let Some(a) = self.write().agents.get_mut(name) {
            a.last_seen -= secs;
        }
    }
}

fn next_id(r: &RoomInner) -> u64 {
    r.messages.last().map(|m| m.id + 1).unwrap_or(1)
}

fn push_system(r: &mut RoomInner, content: String) -> Message {
    let msg = Message {
        id: next_id(r),
        from: SYSTEM.to_string(),
        to: ALL.to_string(),
        original_to: String::new(),
        content,
        timestamp: types::timestamp(),
        kind: MessageType::System,
        routed_by_manager: false,
        expects_reply: false,
        priority: Priority::Normal,
    };
    r.messages.push(msg.clone());
    msg
}

fn cleanup_stale(r: &mut RoomInner) {
    let now = types::now();
    let before = r.agents.len();
    r.agents
        .retain(|_, info| now - info.last_seen < STALE_TIMEOUT_SECS);
    if r.agents.len() != before {
        r.dirty = true;
    }
    expire_manager(r);
}

/// Release the manager lock when the manager left the roster or the
/// heartbeat timed out.
fn expire_manager(r: &mut RoomInner) {
    if r.manager_agent.is_empty() {
        return;
    }
    let gone = !r.agents.contains_key(&r.manager_agent);
    let timed_out = types::now() - r.manager_last_seen > MANAGER_TIMEOUT_SECS;
    if gone || timed_out {
        r.manager_agent.clear();
        r.manager_last_seen = 0.0;
    }
}

fn active_manager(r: &mut RoomInner) -> String {
    expire_manager(r);
    r.manager_agent.clone()
}

fn clamp_recent(mut filtered: Vec<Message>, limit: usize) -> (Vec<Message>, usize) {
    let total = filtered.len();
    if limit > 0 && filtered.len() > limit {
        filtered.drain(..total - limit);
    }
    (filtered, total)
}

/// Sorted room listing over a set of rooms.
pub fn list_room_infos<'a>(
    rooms: impl Iterator<Item = (&'a String, &'a RoomState)>,
) -> Vec<RoomInfo> {
    let mut infos: Vec<RoomInfo> = rooms
        .map(|(name, room)| {
            let (agents, messages) = room.info();
            RoomInfo {
                name: name.clone(),
                agents,
                messages,
            }
        })
        .collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    infos
}
