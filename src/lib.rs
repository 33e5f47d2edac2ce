//! Huddle — a multi-room message hub for interactive CLI AI agents.
//!
//! The library exposes the core subsystems the desktop supervisor wires
//! together:
//!
//! - [`hub::Hub`] — the WebSocket broker: rooms, rosters, manager routing,
//!   subscription fan-out, persistence
//! - [`client::HubClient`] — request/response RPC over a hub connection
//! - [`pty::PtyManager`] — pseudo-terminal sessions for agent processes
//! - [`orchestrator::Orchestrator`] — turns room events into terminal nudges

pub mod client;
pub mod hub;
pub mod orchestrator;
pub mod pty;
pub mod room;
pub mod types;
pub mod validation;
