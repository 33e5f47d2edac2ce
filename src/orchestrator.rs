//! Routes room events to agent terminals.
//!
//! For every `message_new` event the orchestrator decides whether the
//! recipients' terminals should be nudged to read their messages. Nudges
//! never embed the message body — agents fetch it through the
//! `read_messages` tool so authorization and truncation stay with the hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::pty::PtyManager;
use crate::types::{events, Event, Message, MessageType, ALL};

/// Minimum spacing between nudges to the same recipient; decisions inside
/// the window are batched into one flush.
pub const NOTIFY_COOLDOWN: Duration = Duration::from_secs(3);

/// Content shorter than this (in code points) can qualify as an ack.
const ACK_MAX_LEN: usize = 80;

/// Short acknowledgments that don't warrant interrupting an agent.
const ACK_PATTERNS: &[&str] = &[
    "thanks", "thank you", "got it", "ok", "okay", "perfect", "great",
    "sounds good", "will do", "understood", "noted", "no problem",
    "you're welcome", "done", "sure", "yes", "yep", "nope", "roger", "ack",
];

/// Interrogatives that always notify, whatever else the content matches.
const QUESTION_PATTERNS: &[&str] = &[
    "?", "how", "what", "when", "where", "who", "which", "why", "can you",
    "could you", "would you", "is it", "are you", "should",
];

/// Destination for nudge text. `PtyManager` is the production sink; tests
/// substitute a recorder.
pub trait NudgeSink: Send + Sync {
    fn deliver(&self, session_id: &str, text: &str);
}

impl NudgeSink for PtyManager {
    fn deliver(&self, session_id: &str, text: &str) {
        if let Err(e) = self.paste_and_submit(session_id, text) {
            warn!("failed to nudge session {session_id}: {e}");
        }
    }
}

/// What to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Notify,
}

/// Classification of a single message.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub action: Action,
    pub reason: &'static str,
    pub is_question: bool,
}

/// Decide whether a message warrants a nudge.
pub fn analyze_message(msg: &Message) -> Analysis {
    let lower = msg.content.to_lowercase();

    let is_question = QUESTION_PATTERNS.iter().any(|p| lower.contains(p));
    let is_short = msg.content.chars().count() < ACK_MAX_LEN;
    let has_ack = ACK_PATTERNS.iter().any(|p| lower.contains(p));
    let is_ack = is_short && has_ack && !is_question;

    if is_ack {
        Analysis {
            action: Action::Skip,
            reason: "short acknowledgment",
            is_question: false,
        }
    } else if is_question {
        Analysis {
            action: Action::Notify,
            reason: "question, response needed",
            is_question: true,
        }
    } else if msg.expects_reply {
        Analysis {
            action: Action::Notify,
            reason: "response expected",
            is_question: false,
        }
    } else {
        Analysis {
            action: Action::Notify,
            reason: "informational",
            is_question: false,
        }
    }
}

type Key = (String, String); // (room, agent)

#[derive(Clone)]
struct PendingNudge {
    from: String,
    broadcast: bool,
}

#[derive(Default)]
struct OrchState {
    /// room → agent → PTY session ID
    sessions: HashMap<String, HashMap<String, String>>,
    last_notified: HashMap<Key, Instant>,
    pending: HashMap<Key, Vec<PendingNudge>>,
    flush_tasks: HashMap<Key, tokio::task::JoinHandle<()>>,
}

/// Observes room events and nudges registered agent terminals.
pub struct Orchestrator {
    sink: Arc<dyn NudgeSink>,
    state: Mutex<OrchState>,
}

impl Orchestrator {
    pub fn new(sink: Arc<dyn NudgeSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(OrchState::default()),
        })
    }

    /// Map an agent's terminal so it can be nudged.
    pub fn register_agent(&self, room: &str, agent_name: &str, session_id: &str) {
        let mut s = self.lock();
        s.sessions
            .entry(room.to_string())
            .or_default()
            .insert(agent_name.to_string(), session_id.to_string());
        debug!("registered agent {agent_name:?} in room {room:?} -> session {session_id}");
    }

    /// Remove an agent's terminal and any cooldown state attached to it.
    pub fn unregister_agent(&self, room: &str, agent_name: &str) {
        let key = (room.to_string(), agent_name.to_string());
        let mut s = self.lock();
        if let Some(agents) = s.sessions.get_mut(room) {
            agents.remove(agent_name);
        }
        s.last_notified.remove(&key);
        s.pending.remove(&key);
        if let Some(task) = s.flush_tasks.remove(&key) {
            task.abort();
        }
    }

    /// Entry point for hub events forwarded by the supervisor.
    pub fn handle_event(self: &Arc<Self>, event: &Event) {
        if event.event != events::MESSAGE_NEW {
            return;
        }
        let Some(raw) = event.data.get("message") else {
            return;
        };
        match serde_json::from_value::<Message>(raw.clone()) {
            Ok(msg) => self.process_message(&event.room, &msg),
            Err(e) => debug!("unparseable message_new payload: {e}"),
        }
    }

    /// Decide and dispatch nudges for one message.
    pub fn process_message(self: &Arc<Self>, room: &str, msg: &Message) {
        if msg.kind == MessageType::System {
            return;
        }

        // Manager-routed traffic always reaches the manager; the classifier
        // only gates peer chatter.
        if msg.routed_by_manager {
            let session = self.lookup(room, &msg.to);
            if let Some(session_id) = session {
                self.notify_agent(room, &msg.to, &session_id, &msg.from, false);
            }
            return;
        }

        let analysis = analyze_message(msg);
        debug!(
            "message {} from {:?}: {:?} ({})",
            msg.id, msg.from, analysis.action, analysis.reason
        );
        if analysis.action == Action::Skip {
            return;
        }

        if msg.to == ALL {
            let recipients: Vec<(String, String)> = {
                let s = self.lock();
                s.sessions
                    .get(room)
                    .map(|agents| {
                        agents
                            .iter()
                            .filter(|(agent, _)| **agent != msg.from)
                            .map(|(a, sid)| (a.clone(), sid.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for (agent, session_id) in recipients {
                self.notify_agent(room, &agent, &session_id, &msg.from, true);
            }
        } else if let Some(session_id) = self.lookup(room, &msg.to) {
            self.notify_agent(room, &msg.to, &session_id, &msg.from, false);
        } else {
            debug!("no registered terminal for {:?} in room {room:?}", msg.to);
        }
    }

    /// Batch of messages (e.g. replayed after reconnect).
    pub fn handle_new_messages(self: &Arc<Self>, room: &str, messages: &[Message]) {
        for msg in messages {
            self.process_message(room, msg);
        }
    }

    fn lookup(&self, room: &str, agent: &str) -> Option<String> {
        self.lock().sessions.get(room)?.get(agent).cloned()
    }

    /// Nudge one recipient, batching when inside the cooldown window.
    fn notify_agent(
        self: &Arc<Self>,
        room: &str,
        agent: &str,
        session_id: &str,
        from: &str,
        broadcast: bool,
    ) {
        let key = (room.to_string(), agent.to_string());

        let text = {
            let mut s = self.lock();
            let within_cooldown = s
                .last_notified
                .get(&key)
                .is_some_and(|t| t.elapsed() < NOTIFY_COOLDOWN);

            if within_cooldown {
                s.pending.entry(key.clone()).or_default().push(PendingNudge {
                    from: from.to_string(),
                    broadcast,
                });

                if !s.flush_tasks.contains_key(&key) {
                    let elapsed = s.last_notified[&key].elapsed();
                    let remaining = NOTIFY_COOLDOWN.saturating_sub(elapsed);
                    let this = Arc::clone(self);
                    let (room, agent, session_id) =
                        (room.to_string(), agent.to_string(), session_id.to_string());
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(remaining).await;
                        this.flush_pending(&room, &agent, &session_id);
                    });
                    s.flush_tasks.insert(key, task);
                }
                return;
            }

            s.last_notified.insert(key, Instant::now());
            nudge_text(from, broadcast)
        };

        // PTY writes block; never hold the state lock across them.
        self.sink.deliver(session_id, &text);
    }

    /// Deliver one combined nudge for everything batched during the window.
    fn flush_pending(&self, room: &str, agent: &str, session_id: &str) {
        let key = (room.to_string(), agent.to_string());

        let text = {
            let mut s = self.lock();
            s.flush_tasks.remove(&key);
            let Some(pending) = s.pending.remove(&key) else {
                return;
            };
            if pending.is_empty() {
                return;
            }
            s.last_notified.insert(key, Instant::now());
            batch_text(&pending)
        };

        self.sink.deliver(session_id, &text);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OrchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn nudge_text(from: &str, broadcast: bool) -> String {
    let from = strip_shell_meta(from);
    if broadcast {
        format!("Broadcast from {from}. Use read_messages to read and respond.")
    } else {
        format!("{from} sent you a message. Use read_messages to read and respond.")
    }
}

fn batch_text(pending: &[PendingNudge]) -> String {
    let mut senders: Vec<String> = Vec::new();
    for nudge in pending {
        let name = strip_shell_meta(&nudge.from);
        if !senders.contains(&name) {
            senders.push(name);
        }
    }
    format!(
        "{} new messages from {}. Use read_messages to read and respond.",
        pending.len(),
        senders.join(", ")
    )
}

/// Remove shell metacharacters from text typed into a terminal.
fn strip_shell_meta(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ';' | '|' | '&' | '$' | '`' | '\\' | '"' | '\'' | '\n' | '\r'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, SYSTEM};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl NudgeSink for RecordingSink {
        fn deliver(&self, session_id: &str, text: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), text.to_string()));
        }
    }

    fn test_orchestrator() -> (Arc<Orchestrator>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let orch = Orchestrator::new(sink.clone() as Arc<dyn NudgeSink>);
        (orch, sink)
    }

    fn message(from: &str, to: &str, content: &str, expects_reply: bool) -> Message {
        Message {
            id: 1,
            from: from.into(),
            to: to.into(),
            original_to: String::new(),
            content: content.into(),
            timestamp: crate::types::timestamp(),
            kind: if to == ALL {
                MessageType::Broadcast
            } else {
                MessageType::Direct
            },
            routed_by_manager: false,
            expects_reply,
            priority: Priority::Normal,
        }
    }

    // ── classification ──

    #[test]
    fn normal_message_notifies() {
        let a = analyze_message(&message("a", "b", "Backend API deployed successfully", true));
        assert_eq!(a.action, Action::Notify);
    }

    #[test]
    fn short_acks_are_skipped() {
        for content in ["thanks!", "ok", "got it, perfect", "done"] {
            let a = analyze_message(&message("a", "b", content, false));
            assert_eq!(a.action, Action::Skip, "{content:?} should skip");
        }
        // Ack word inside a long message doesn't suppress the nudge.
        let long = "This is a long status update and even though it says thanks \
                    somewhere it is well over the ack length cutoff so it must notify";
        assert_eq!(analyze_message(&message("a", "b", long, false)).action, Action::Notify);
        // expects_reply doesn't resurrect an ack.
        assert_eq!(analyze_message(&message("a", "b", "ok", true)).action, Action::Skip);
    }

    #[test]
    fn questions_always_notify() {
        for content in [
            "Is the API ready?",
            "how does this work",
            "can you fix the bug",
            "ok but why",
        ] {
            let a = analyze_message(&message("a", "b", content, false));
            assert_eq!(a.action, Action::Notify, "{content:?} should notify");
            assert!(a.is_question, "{content:?} should be a question");
        }
    }

    #[test]
    fn informational_and_empty_notify() {
        assert_eq!(
            analyze_message(&message("a", "b", "Deployed the backend to production", false)).action,
            Action::Notify
        );
        assert_eq!(analyze_message(&message("a", "b", "", false)).action, Action::Notify);
    }

    // ── registration ──

    #[test]
    fn register_unregister() {
        let (orch, _) = test_orchestrator();
        orch.register_agent("t", "agent-1", "sess-1");
        orch.register_agent("t", "agent-2", "sess-2");
        assert_eq!(orch.lookup("t", "agent-1").as_deref(), Some("sess-1"));

        orch.unregister_agent("t", "agent-1");
        assert!(orch.lookup("t", "agent-1").is_none());
        assert_eq!(orch.lookup("t", "agent-2").as_deref(), Some("sess-2"));

        // Unknown agents are a no-op.
        orch.unregister_agent("t", "ghost");
    }

    // ── routing ──

    #[test]
    fn system_messages_are_ignored() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "a1", "sess-1");
        let mut msg = message(SYSTEM, ALL, "a1 joined the room", false);
        msg.kind = MessageType::System;
        orch.process_message("t", &msg);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn ack_creates_no_state() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "a1", "sess-1");
        orch.process_message("t", &message("a2", "a1", "thanks", false));
        assert!(sink.sent.lock().unwrap().is_empty());
        let s = orch.lock();
        assert!(s.pending.is_empty());
        assert!(s.last_notified.is_empty());
    }

    #[test]
    fn unknown_rooms_and_targets_are_tolerated() {
        let (orch, sink) = test_orchestrator();
        orch.process_message("nowhere", &message("a", "b", "Hello?", true));
        orch.register_agent("t", "a1", "sess-1");
        orch.process_message("t", &message("a1", "a3", "Hey there?", true));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn direct_message_notifies_target_only() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "alice", "sess-alice");
        orch.register_agent("t", "bob", "sess-bob");
        orch.register_agent("t", "carol", "sess-carol");

        orch.process_message("t", &message("alice", "bob", "Review my PR please", true));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "sess-bob");
        assert!(sent[0].1.contains("alice"));
        assert!(sent[0].1.contains("read_messages"));
        assert!(!sent[0].1.contains("Broadcast"));
    }

    #[test]
    fn broadcast_excludes_sender() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "alice", "sess-alice");
        orch.register_agent("t", "bob", "sess-bob");
        orch.register_agent("t", "carol", "sess-carol");

        orch.process_message("t", &message("alice", ALL, "Deploy finished, please verify", true));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(sid, _)| sid != "sess-alice"));
        assert!(sent.iter().all(|(_, text)| text.contains("Broadcast")));
    }

    #[test]
    fn manager_routed_bypasses_classifier() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "manager", "sess-manager");

        // Content that would classify as an ack still notifies the manager.
        let mut msg = message("agent-2", "manager", "ok", false);
        msg.original_to = "agent-1".into();
        msg.routed_by_manager = true;
        orch.process_message("t", &msg);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "sess-manager");
        assert!(sent[0].1.contains("agent-2"));
    }

    #[test]
    fn rooms_are_isolated() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("team1", "alice", "sess-alice-1");
        orch.register_agent("team2", "alice", "sess-alice-2");
        orch.register_agent("team1", "bob", "sess-bob-1");

        orch.process_message("team1", &message("alice", ALL, "Team1 update, please ack", true));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "sess-bob-1");
    }

    #[test]
    fn handle_event_parses_message_new() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "bob", "sess-bob");
        let event = Event {
            kind: "event".into(),
            event: events::MESSAGE_NEW.into(),
            room: "t".into(),
            data: serde_json::json!({
                "message": message("alice", "bob", "Can you deploy the API?", true)
            }),
        };
        orch.handle_event(&event);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        // Other event kinds are ignored.
        let cleared = Event {
            kind: "event".into(),
            event: events::ROOM_CLEARED.into(),
            room: "t".into(),
            data: serde_json::json!({}),
        };
        orch.handle_event(&cleared);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    // ── cooldown batching ──

    #[tokio::test(start_paused = true)]
    async fn second_nudge_within_window_is_batched() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "bob", "sess-bob");

        orch.process_message("t", &message("alice", "bob", "First message, respond", true));
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        orch.process_message("t", &message("carol", "bob", "Second message, respond", true));
        orch.process_message("t", &message("alice", "bob", "Third message, respond", true));
        assert_eq!(sink.sent.lock().unwrap().len(), 1, "should be batched");
        {
            let s = orch.lock();
            let key = ("t".to_string(), "bob".to_string());
            assert_eq!(s.pending[&key].len(), 2);
            assert!(s.flush_tasks.contains_key(&key));
        }

        // Let the flush timer fire.
        tokio::time::sleep(NOTIFY_COOLDOWN + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let flushed = &sent[1].1;
        assert!(flushed.contains("2 new messages"), "got: {flushed}");
        assert!(flushed.contains("carol") && flushed.contains("alice"));

        drop(sent);
        let s = orch.lock();
        assert!(s.pending.is_empty());
        assert!(s.flush_tasks.is_empty());
    }

    #[tokio::test]
    async fn expired_cooldown_sends_immediately() {
        let (orch, sink) = test_orchestrator();
        orch.register_agent("t", "bob", "sess-bob");
        if let Some(past) = Instant::now().checked_sub(Duration::from_secs(5)) {
            let mut s = orch.lock();
            s.last_notified.insert(("t".to_string(), "bob".to_string()), past);
        }
        orch.process_message("t", &message("alice", "bob", "Please respond", true));
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        let s = orch.lock();
        assert!(s.pending.is_empty());
    }

    #[tokio::test]
    async fn unregister_cleans_cooldown_state() {
        let (orch, _) = test_orchestrator();
        orch.register_agent("t", "a1", "sess-1");
        let key = ("t".to_string(), "a1".to_string());
        {
            let mut s = orch.lock();
            s.last_notified.insert(key.clone(), Instant::now());
            s.pending.insert(
                key.clone(),
                vec![PendingNudge {
                    from: "a2".into(),
                    broadcast: false,
                }],
            );
            let task = tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
            s.flush_tasks.insert(key.clone(), task);
        }

        orch.unregister_agent("t", "a1");

        let s = orch.lock();
        assert!(!s.last_notified.contains_key(&key));
        assert!(!s.pending.contains_key(&key));
        assert!(!s.flush_tasks.contains_key(&key));
    }

    #[test]
    fn batch_text_deduplicates_senders() {
        let pending = vec![
            PendingNudge { from: "a".into(), broadcast: false },
            PendingNudge { from: "b".into(), broadcast: true },
            PendingNudge { from: "a".into(), broadcast: false },
        ];
        let text = batch_text(&pending);
        assert!(text.contains("3 new messages from a, b"));
    }

    #[test]
    fn shell_metachars_are_stripped_from_nudges() {
        let text = nudge_text("evil;rm -rf $HOME`x`", false);
        for c in [';', '$', '`'] {
            assert!(!text.contains(c), "{c:?} should be stripped from {text}");
        }
    }
}
