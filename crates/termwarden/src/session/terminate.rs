//! Forceful session termination.
//!
//! Every step runs regardless of whether the previous one worked, and the
//! call always succeeds from the caller's point of view: the goal is
//! process absence, so "no such process" anywhere means the goal is already
//! achieved. SIGKILL is deliberate — a soft close request would make the
//! terminal application raise a confirmation dialog, which is exactly what
//! this component exists to avoid.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::probe;
use crate::terminal::TerminalControl;

use super::{Session, SessionRegistry};

/// Grace period for direct children after their kill signal.
const CHILD_KILL_WAIT: Duration = Duration::from_millis(500);
/// How long to re-probe the main pid before logging that it survived.
const DEATH_CONFIRM_WAIT: Duration = Duration::from_secs(2);
const DEATH_POLL: Duration = Duration::from_millis(100);

pub struct ForcefulTerminator {
    terminal: Arc<dyn TerminalControl>,
    registry: SessionRegistry,
}

impl ForcefulTerminator {
    pub fn new(terminal: Arc<dyn TerminalControl>, registry: SessionRegistry) -> Self {
        Self { terminal, registry }
    }

    /// Kill the session's child tree and process, close its window, and
    /// evict it from the registry.
    ///
    /// Returns whether process death was confirmed. Idempotent: a second
    /// call on an already-dead session is a no-op that returns `true`.
    pub async fn terminate(&self, session: &Session) -> bool {
        // 1. Children first (one level, not recursive), so the main kill
        //    does not orphan them mid-shutdown.
        let children = probe::child_pids(session.pid).await;
        for child in &children {
            if let Err(e) = probe::kill_hard(*child) {
                warn!(session = %session.session_id, child, error = %e, "child kill failed");
            }
        }
        if !children.is_empty() {
            debug!(session = %session.session_id, count = children.len(), "killed child processes");
            tokio::time::sleep(CHILD_KILL_WAIT).await;
        }

        // 2. The session process itself.
        if let Err(e) = probe::kill_hard(session.pid) {
            warn!(session = %session.session_id, pid = session.pid, error = %e, "process kill failed");
        }

        // 3. Confirm death; survival is logged, not fatal.
        let confirmed =
            probe::wait_for_death(session.pid, DEATH_CONFIRM_WAIT, DEATH_POLL).await;
        if !confirmed {
            warn!(
                session = %session.session_id,
                pid = session.pid,
                "process still alive after kill signal"
            );
        }

        // 4. Close the window, independent of death confirmation.
        if let Err(e) = self.terminal.close_window(&session.window).await {
            warn!(session = %session.session_id, window = %session.window, error = %e, "window close failed");
        }

        // 5. Remove the rendezvous file and the registry entry.
        match tokio::fs::remove_file(&session.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %session.pid_file.display(), error = %e, "pid file removal failed");
            }
        }
        self.registry.remove(&session.session_id);

        info!(session = %session.session_id, pid = session.pid, confirmed, "session terminated");
        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SpawnRequest, TerminalSpawner, pid_file_path};
    use crate::terminal::{ScriptError, WindowId, WindowPosition};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ShellTerminal {
        typed: Mutex<String>,
        closed: Mutex<Vec<String>>,
    }

    impl ShellTerminal {
        fn new() -> Self {
            Self {
                typed: Mutex::new(String::new()),
                closed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TerminalControl for ShellTerminal {
        async fn open_window(&self, _p: WindowPosition) -> Result<WindowId, ScriptError> {
            Ok(WindowId("7".to_string()))
        }

        async fn type_text(&self, _w: &WindowId, text: &str) -> Result<(), ScriptError> {
            self.typed.lock().unwrap().push_str(text);
            Ok(())
        }

        async fn paste_text(&self, _w: &WindowId, _t: &str) -> Result<(), ScriptError> {
            Ok(())
        }

        async fn press_enter(&self, _w: &WindowId) -> Result<(), ScriptError> {
            let command = std::mem::take(&mut *self.typed.lock().unwrap());
            let mut child = tokio::process::Command::new("bash")
                .args(["-c", &command])
                .spawn()?;
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(())
        }

        async fn close_window(&self, w: &WindowId) -> Result<(), ScriptError> {
            self.closed.lock().unwrap().push(w.0.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn terminate_kills_and_evicts() {
        let workdir = TempDir::new().unwrap();
        let terminal = Arc::new(ShellTerminal::new());
        let registry = SessionRegistry::new();
        let spawner = TerminalSpawner::new(terminal.clone(), registry.clone());
        let terminator = ForcefulTerminator::new(terminal.clone(), registry.clone());

        let session = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: workdir.path(),
                label: None,
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap();

        let confirmed = terminator.terminate(&session).await;
        assert!(confirmed);
        assert!(!probe::is_alive(session.pid));
        assert!(registry.get("s1").is_none());
        assert!(!session.pid_file.exists());
        assert_eq!(*terminal.closed.lock().unwrap(), vec!["7".to_string()]);
    }

    #[tokio::test]
    async fn terminate_twice_is_a_no_op() {
        let workdir = TempDir::new().unwrap();
        let terminal = Arc::new(ShellTerminal::new());
        let registry = SessionRegistry::new();
        let spawner = TerminalSpawner::new(terminal.clone(), registry.clone());
        let terminator = ForcefulTerminator::new(terminal.clone(), registry.clone());

        let session = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: workdir.path(),
                label: None,
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap();

        assert!(terminator.terminate(&session).await);
        // Second call: process gone, pid file gone, registry empty. Must not
        // fail or panic.
        assert!(terminator.terminate(&session).await);
    }

    #[tokio::test]
    async fn terminate_unknown_session_succeeds() {
        let terminal = Arc::new(ShellTerminal::new());
        let registry = SessionRegistry::new();
        let terminator = ForcefulTerminator::new(terminal, registry);

        let session = Session {
            session_id: "ghost".to_string(),
            label: None,
            window: WindowId("9".to_string()),
            pid: 4_000_000,
            working_directory: PathBuf::from("/tmp"),
            pid_file: pid_file_path(std::path::Path::new("/tmp"), "ghost"),
            spawned_at: Utc::now(),
        };

        assert!(terminator.terminate(&session).await);
    }
}
