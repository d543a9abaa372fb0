//! Termwarden - a watchdog supervisor for terminal-hosted CLI agent sessions.
//!
//! Spawns an external program in a real terminal window, learns its pid
//! through a pid-file rendezvous, injects keystrokes into it, listens for
//! status notifications over a local socket, and forcibly restarts or kills
//! the session when a cycle ends, the plan completes, or the watchdog
//! deadline expires.

pub mod channel;
pub mod config;
pub mod probe;
pub mod session;
pub mod terminal;
pub mod watchdog;
