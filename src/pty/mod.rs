//! Pseudo-terminal sessions for interactive agent CLIs.
//!
//! Each session wraps a child process attached to its own PTY. A background
//! thread drains the master side into the output callback, carrying
//! incomplete UTF-8 sequences across reads so subscribers only ever see
//! whole code points.

mod terminate;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use uuid::Uuid;

/// Called with `(session_id, bytes)` for every chunk of PTY output.
pub type OutputHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Environment variables stripped from children so a nested agent CLI does
/// not mistake itself for the outer session.
const NESTED_SESSION_MARKERS: &[&str] = &["CLAUDECODE"];

/// Grace window between SIGTERM and SIGKILL during close.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

const BRACKET_OPEN: &str = "\x1b[200~";
const BRACKET_CLOSE: &str = "\x1b[201~";

/// The kind of interactive CLI running in a session. Selects the input
/// shaping strategy and the graceful exit command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CliType {
    Claude,
    Gemini,
    Codex,
    Copilot,
    Shell,
    #[default]
    Other,
}

impl CliType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Self::Claude,
            "gemini" => Self::Gemini,
            "codex" => Self::Codex,
            "copilot" => Self::Copilot,
            "shell" => Self::Shell,
            _ => Self::Other,
        }
    }

    /// Interactive command that asks the CLI to exit cleanly, if it has one.
    pub fn graceful_exit(&self) -> Option<&'static str> {
        match self {
            Self::Claude | Self::Copilot | Self::Codex => Some("/exit\r"),
            Self::Gemini => Some("/quit\r"),
            Self::Shell => Some("exit\r"),
            Self::Other => None,
        }
    }

    /// Ink-style TUIs ignore bulk PTY writes and need keystroke pacing.
    fn needs_char_drip(&self) -> bool {
        matches!(self, Self::Copilot)
    }
}

/// Immutable description of a live session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub room: String,
    pub agent_name: String,
    pub cli_type: CliType,
    pub pid: Option<u32>,
}

struct Session {
    meta: SessionMeta,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>,
    /// Unix-nano timestamp of the last output byte; 0 before first output.
    last_output: Arc<AtomicU64>,
}

/// Owns every PTY session, keyed by opaque ID.
pub struct PtyManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    on_output: OutputHandler,
}

impl PtyManager {
    pub fn new(on_output: OutputHandler) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            on_output,
        }
    }

    /// Spawn `cmd args` in a fresh PTY and start draining its output.
    /// An empty `cmd` falls back to the login shell. Returns the session ID.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        room: &str,
        agent_name: &str,
        work_dir: &str,
        env: &[(String, String)],
        cmd: &str,
        args: &[String],
        cli_type: CliType,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("failed to open pty: {e}"))?;

        let mut shell_args: Vec<String> = args.to_vec();
        let cmd_name = if cmd.is_empty() {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| {
                if cfg!(windows) {
                    "cmd.exe".to_string()
                } else {
                    "/bin/sh".to_string()
                }
            });
            if !cfg!(windows) {
                shell_args = vec!["-l".to_string()];
            }
            shell
        } else {
            cmd.to_string()
        };

        let mut builder = CommandBuilder::new(&cmd_name);
        builder.args(&shell_args);
        if !work_dir.is_empty() {
            builder.cwd(work_dir);
        }
        for marker in NESTED_SESSION_MARKERS {
            builder.env_remove(marker);
        }
        builder.env("TERM", "xterm-256color");
        for (key, value) in env {
            builder.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| anyhow!("failed to spawn {cmd_name}: {e}"))?;
        let pid = child.process_id();
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("failed to clone pty reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("failed to take pty writer: {e}"))?;

        let last_output = Arc::new(AtomicU64::new(0));
        let session = Arc::new(Session {
            meta: SessionMeta {
                id: id.clone(),
                room: room.to_string(),
                agent_name: agent_name.to_string(),
                cli_type,
                pid,
            },
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(Some(child)),
            last_output: Arc::clone(&last_output),
        });

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), session);

        spawn_read_loop(id.clone(), reader, Arc::clone(&self.on_output), last_output);

        info!("created pty session {id} pid={pid:?} agent={agent_name:?} cmd={cmd_name}");
        Ok(id)
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow!("session not found: {session_id}"))
    }

    /// Raw write to the session's PTY.
    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let session = self.session(session_id)?;
        let mut writer = session.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data).context("pty write")?;
        writer.flush().context("pty flush")?;
        Ok(())
    }

    /// Type `text` into the session and submit it, shaping the input for
    /// the session's CLI. Blocks for the settle delays; call from a
    /// blocking-friendly context.
    pub fn paste_and_submit(&self, session_id: &str, text: &str) -> Result<()> {
        let session = self.session(session_id)?;

        if session.meta.cli_type.needs_char_drip() {
            // Keystroke simulation: bulk writes don't reach the framework's
            // input handler.
            let mut buf = [0u8; 4];
            for c in text.chars() {
                self.write(session_id, c.encode_utf8(&mut buf).as_bytes())?;
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(100));
            self.write(session_id, b"\r")
        } else {
            // Bracketed paste keeps the line editor from interpreting the
            // text as individual keystrokes.
            let framed = format!("{BRACKET_OPEN}{text}{BRACKET_CLOSE}");
            self.write(session_id, framed.as_bytes())?;
            std::thread::sleep(Duration::from_millis(200));
            self.write(session_id, b"\r")
        }
    }

    /// Resize the PTY window.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.session(session_id)?;
        let result = session
            .master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("failed to resize pty: {e}"));
        result
    }

    /// Wait until no output has arrived for `idle`, polling, bounded by
    /// `max_wait`. Returns whether the session went idle.
    pub fn wait_for_idle(&self, session_id: &str, idle: Duration, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        while Instant::now() < deadline {
            let Ok(session) = self.session(session_id) else {
                return false;
            };
            let nanos = session.last_output.load(Ordering::Relaxed);
            if nanos > 0 {
                let elapsed = crate::types::now() - nanos as f64 / 1e9;
                if elapsed >= idle.as_secs_f64() {
                    return true;
                }
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        false
    }

    /// Session metadata, if the session is live.
    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|s| s.meta.clone())
    }

    /// All live session IDs.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Close a session: ask the CLI to exit, close the master, then tear
    /// down the whole process group. Blocks up to the grace window plus the
    /// reap deadline.
    pub fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .ok_or_else(|| anyhow!("session not found: {session_id}"))?;

        info!("closing pty session {session_id}");

        if let Some(exit_cmd) = session.meta.cli_type.graceful_exit() {
            let mut writer = session.writer.lock().unwrap_or_else(|e| e.into_inner());
            if writer.write_all(exit_cmd.as_bytes()).and_then(|_| writer.flush()).is_ok() {
                drop(writer);
                std::thread::sleep(Duration::from_millis(250));
            }
        }

        let child = session
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let pid = session.meta.pid;
        // Closing the master unblocks the reader thread with EOF.
        drop(session);

        match child {
            Some(child) => terminate::terminate_tree(child, pid, TERMINATE_GRACE),
            None => Ok(()),
        }
    }

    /// Close every session, logging failures.
    pub fn close_all(&self) {
        for id in self.session_ids() {
            if let Err(e) = self.close(&id) {
                warn!("failed to close session {id}: {e}");
            }
        }
    }
}

fn spawn_read_loop(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    on_output: OutputHandler,
    last_output: Arc<AtomicU64>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => {
                    if !carry.is_empty() {
                        on_output(&session_id, &carry);
                    }
                    debug!("pty reader for {session_id} exited");
                    return;
                }
                Ok(n) => {
                    last_output.store(unix_nanos(), Ordering::Relaxed);

                    let chunk: Vec<u8> = if carry.is_empty() {
                        buf[..n].to_vec()
                    } else {
                        let mut c = std::mem::take(&mut carry);
                        c.extend_from_slice(&buf[..n]);
                        c
                    };

                    let send_len = complete_utf8_len(&chunk);
                    if send_len < chunk.len() {
                        carry = chunk[send_len..].to_vec();
                    }
                    if send_len > 0 {
                        on_output(&session_id, &chunk[..send_len]);
                    }
                }
            }
        }
    });
}

fn unix_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Length of the longest prefix of `b` that ends on a UTF-8 code point
/// boundary. A trailing incomplete multi-byte sequence is excluded.
fn complete_utf8_len(b: &[u8]) -> usize {
    let n = b.len();
    if n == 0 {
        return 0;
    }

    // Scan backwards over at most 3 trailing bytes looking for the lead
    // byte of an unfinished sequence.
    let start = n.saturating_sub(4);
    for i in (start..n).rev() {
        let c = b[i];
        if c < 0x80 {
            return n;
        }
        if c >= 0xc0 {
            let seq_len = match c {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                _ => 4,
            };
            return if n - i >= seq_len { n } else { i };
        }
        // 0x80..=0xbf: continuation byte, keep scanning.
    }
    n
}
