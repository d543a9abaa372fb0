//! Session lifecycle: spawn, keystroke injection, forceful termination.
//!
//! A [`Session`] is one spawned terminal-hosted program: the window that
//! hosts it, the pid of the shell that exec'd it, and the pid-file
//! rendezvous used during spawn to learn that pid. Sessions live in a
//! [`SessionRegistry`] keyed by session id; the supervisor owns exactly one
//! at a time, but the registry itself does not assume that.

mod inject;
mod spawn;
mod terminate;

pub use inject::TextInjector;
pub use spawn::{SpawnError, SpawnRequest, TerminalSpawner};
pub use terminate::ForcefulTerminator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::probe;
use crate::terminal::WindowId;

/// Hidden subdirectory inside a session's working directory holding the
/// pid-file rendezvous.
pub const RENDEZVOUS_DIR: &str = ".termwarden";

/// Path of the pid-file the spawned shell writes for `session_id`.
pub fn pid_file_path(working_directory: &Path, session_id: &str) -> PathBuf {
    working_directory
        .join(RENDEZVOUS_DIR)
        .join(format!("{}.pid", session_id))
}

// ============================================================================
// Session
// ============================================================================

/// One spawned terminal-hosted program instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub label: Option<String>,
    pub window: WindowId,
    /// Pid of the shell that exec'd the target program.
    pub pid: u32,
    pub working_directory: PathBuf,
    pub pid_file: PathBuf,
    pub spawned_at: DateTime<Utc>,
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Active sessions, keyed by session id. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        self.entries.insert(session.session_id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.entries.get(session_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.entries.remove(session_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every session whose pid no longer probes alive.
    ///
    /// Eviction is not automatic on death; this sweep (or the terminator) is
    /// what keeps the invariant that no registered session points at a dead
    /// pid.
    pub fn evict_dead(&self) -> Vec<Session> {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !probe::is_alive(e.value().pid))
            .map(|e| e.key().clone())
            .collect();

        dead.iter()
            .filter_map(|id| {
                self.entries.remove(id).map(|(_, s)| {
                    info!(session = %s.session_id, pid = s.pid, "evicted dead session");
                    s
                })
            })
            .collect()
    }
}
