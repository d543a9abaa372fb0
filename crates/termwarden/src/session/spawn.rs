//! Terminal session spawning.
//!
//! The spawn rendezvous works through the filesystem: the new window runs a
//! shell chain that `cd`s into the working directory, writes the shell's own
//! pid (`$$`) to a pid-file, then `exec`s the target program. We poll for
//! that file, parse the pid, and confirm it probes alive before handing a
//! [`Session`] back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::probe;
use crate::terminal::{ScriptError, TerminalControl, WindowId, WindowPosition};

use super::inject::chunk_text;
use super::{Session, SessionRegistry, pid_file_path};

/// How long the pid-file may take to appear.
const PID_FILE_WAIT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the pid-file.
const PID_FILE_POLL: Duration = Duration::from_millis(100);
/// The spawn chain goes through the same bounded-chunk typing as prompt
/// injection; long working-directory paths push it past the rate at which
/// the keystroke mechanism starts dropping characters.
const CHAIN_CHUNK_CHARS: usize = 100;
const CHAIN_CHUNK_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Public types
// ============================================================================

/// Parameters for one spawn attempt.
pub struct SpawnRequest<'a> {
    pub session_id: &'a str,
    /// Command line the shell will `exec` after writing the pid-file.
    pub command: &'a str,
    pub working_directory: &'a Path,
    pub label: Option<&'a str>,
    pub position: WindowPosition,
}

/// Spawn failures, named by the stage that failed.
///
/// Always fatal to that spawn attempt; never auto-retried.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("working directory does not exist: {0}")]
    WorkdirMissing(PathBuf),

    #[error("window scripting failed while {stage}: {source}")]
    Scripting {
        stage: &'static str,
        #[source]
        source: ScriptError,
    },

    #[error("pid file {path} not written within {timeout:?}")]
    PidFileTimeout { path: PathBuf, timeout: Duration },

    #[error("spawned process {pid} is not alive")]
    ProcessDead { pid: u32 },

    #[error("failed to prepare rendezvous directory: {0}")]
    Rendezvous(#[from] std::io::Error),
}

// ============================================================================
// TerminalSpawner
// ============================================================================

pub struct TerminalSpawner {
    terminal: Arc<dyn TerminalControl>,
    registry: SessionRegistry,
}

impl TerminalSpawner {
    pub fn new(terminal: Arc<dyn TerminalControl>, registry: SessionRegistry) -> Self {
        Self { terminal, registry }
    }

    /// Spawn a new terminal-hosted session and register it.
    ///
    /// Never returns a [`Session`] whose pid did not probe alive.
    pub async fn spawn(&self, req: SpawnRequest<'_>) -> Result<Session, SpawnError> {
        if !req.working_directory.is_dir() {
            return Err(SpawnError::WorkdirMissing(req.working_directory.to_path_buf()));
        }

        let pid_file = pid_file_path(req.working_directory, req.session_id);
        self.prepare_rendezvous(&pid_file).await?;

        let window = self
            .terminal
            .open_window(req.position)
            .await
            .map_err(|source| SpawnError::Scripting { stage: "opening window", source })?;

        let chain = bootstrap_command(req.working_directory, &pid_file, req.command);
        debug!(session = %req.session_id, window = %window, "running spawn chain");

        if let Err(source) = self.type_chain(&window, &chain).await {
            self.abandon_window(&window).await;
            return Err(SpawnError::Scripting { stage: "typing spawn chain", source });
        }

        let pid = match self.wait_for_pid_file(&pid_file).await {
            Some(pid) => pid,
            None => {
                self.abandon_window(&window).await;
                return Err(SpawnError::PidFileTimeout {
                    path: pid_file,
                    timeout: PID_FILE_WAIT,
                });
            }
        };

        if !probe::is_alive(pid) {
            self.abandon_window(&window).await;
            return Err(SpawnError::ProcessDead { pid });
        }

        let session = Session {
            session_id: req.session_id.to_string(),
            label: req.label.map(|s| s.to_string()),
            window,
            pid,
            working_directory: req.working_directory.to_path_buf(),
            pid_file,
            spawned_at: Utc::now(),
        };
        self.registry.insert(session.clone());
        Ok(session)
    }

    /// Type the spawn chain in bounded chunks, then submit it.
    async fn type_chain(&self, window: &WindowId, chain: &str) -> Result<(), ScriptError> {
        let chunks = chunk_text(chain, CHAIN_CHUNK_CHARS);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            self.terminal.type_text(window, chunk).await?;
            if i < last {
                tokio::time::sleep(CHAIN_CHUNK_DELAY).await;
            }
        }
        self.terminal.press_enter(window).await
    }

    /// Create the hidden rendezvous directory and delete any stale pid-file
    /// left by a previous failed spawn, so we never read a stale pid.
    async fn prepare_rendezvous(&self, pid_file: &Path) -> Result<(), SpawnError> {
        if let Some(dir) = pid_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(pid_file).await {
            Ok(()) => debug!(path = %pid_file.display(), "removed stale pid file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SpawnError::Rendezvous(e)),
        }
        Ok(())
    }

    /// Poll for the pid-file and parse it.
    ///
    /// A file that exists but does not yet parse is treated as mid-write and
    /// polled again.
    async fn wait_for_pid_file(&self, pid_file: &Path) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + PID_FILE_WAIT;
        loop {
            if let Ok(contents) = tokio::fs::read_to_string(pid_file).await
                && let Ok(pid) = contents.trim().parse::<u32>()
            {
                return Some(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(PID_FILE_POLL).await;
        }
    }

    /// Best-effort close of a window whose spawn failed, so failed attempts
    /// do not leak windows.
    async fn abandon_window(&self, window: &WindowId) {
        if let Err(e) = self.terminal.close_window(window).await {
            warn!(window = %window, error = %e, "could not close window of failed spawn");
        }
    }
}

/// Build the single-line shell chain typed into the new window.
fn bootstrap_command(working_directory: &Path, pid_file: &Path, command: &str) -> String {
    format!(
        "cd '{}' && echo $$ > '{}' && exec {}",
        shell_quote(&working_directory.to_string_lossy()),
        shell_quote(&pid_file.to_string_lossy()),
        command,
    )
}

/// Escape for embedding inside single quotes.
fn shell_quote(text: &str) -> String {
    text.replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{TerminalControl, WindowId};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Test backend that executes whatever was typed through `bash -c` when
    /// Enter is pressed, so the pid-file choreography runs for real.
    struct ShellTerminal {
        typed: Mutex<String>,
        type_calls: Mutex<usize>,
    }

    impl ShellTerminal {
        fn new() -> Self {
            Self {
                typed: Mutex::new(String::new()),
                type_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TerminalControl for ShellTerminal {
        async fn open_window(&self, _position: WindowPosition) -> Result<WindowId, ScriptError> {
            Ok(WindowId("1".to_string()))
        }

        async fn type_text(&self, _window: &WindowId, text: &str) -> Result<(), ScriptError> {
            *self.type_calls.lock().unwrap() += 1;
            self.typed.lock().unwrap().push_str(text);
            Ok(())
        }

        async fn paste_text(&self, _window: &WindowId, text: &str) -> Result<(), ScriptError> {
            self.typed.lock().unwrap().push_str(text);
            Ok(())
        }

        async fn press_enter(&self, _window: &WindowId) -> Result<(), ScriptError> {
            let command = std::mem::take(&mut *self.typed.lock().unwrap());
            let mut child = tokio::process::Command::new("bash")
                .args(["-c", &command])
                .spawn()?;
            // Reap in the background so a killed session does not linger as
            // a zombie that still probes alive.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            Ok(())
        }

        async fn close_window(&self, _window: &WindowId) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    /// Backend whose windows never run anything, so the pid-file never
    /// appears.
    struct DeadTerminal;

    #[async_trait]
    impl TerminalControl for DeadTerminal {
        async fn open_window(&self, _position: WindowPosition) -> Result<WindowId, ScriptError> {
            Ok(WindowId("1".to_string()))
        }
        async fn type_text(&self, _w: &WindowId, _t: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        async fn paste_text(&self, _w: &WindowId, _t: &str) -> Result<(), ScriptError> {
            Ok(())
        }
        async fn press_enter(&self, _w: &WindowId) -> Result<(), ScriptError> {
            Ok(())
        }
        async fn close_window(&self, _w: &WindowId) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    #[test]
    fn bootstrap_chain_shape() {
        let chain = bootstrap_command(
            Path::new("/work dir"),
            Path::new("/work dir/.termwarden/s1.pid"),
            "sleep 60",
        );
        assert_eq!(
            chain,
            "cd '/work dir' && echo $$ > '/work dir/.termwarden/s1.pid' && exec sleep 60"
        );
    }

    #[test]
    fn shell_quote_single_quotes() {
        assert_eq!(shell_quote("it's"), "it'\\''s");
    }

    #[tokio::test]
    async fn spawn_learns_pid_and_registers() {
        let workdir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let spawner = TerminalSpawner::new(Arc::new(ShellTerminal::new()), registry.clone());

        let session = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: workdir.path(),
                label: Some("test"),
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap();

        assert!(probe::is_alive(session.pid));
        assert!(session.pid_file.exists());
        assert_eq!(registry.get("s1").unwrap().pid, session.pid);

        probe::kill_hard(session.pid).unwrap();
    }

    #[tokio::test]
    async fn long_chain_is_typed_in_bounded_chunks() {
        let workdir = TempDir::new().unwrap();
        // A deep path pushes the chain (which embeds it twice) well past
        // one chunk.
        let deep = workdir.path().join("d".repeat(120));
        std::fs::create_dir_all(&deep).unwrap();

        let terminal = Arc::new(ShellTerminal::new());
        let spawner = TerminalSpawner::new(terminal.clone(), SessionRegistry::new());

        let session = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: &deep,
                label: None,
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap();

        assert!(*terminal.type_calls.lock().unwrap() >= 2);
        assert!(probe::is_alive(session.pid));
        probe::kill_hard(session.pid).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_times_out_without_pid_file() {
        let workdir = TempDir::new().unwrap();
        let spawner = TerminalSpawner::new(Arc::new(DeadTerminal), SessionRegistry::new());

        let err = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: workdir.path(),
                label: None,
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SpawnError::PidFileTimeout { .. }));
    }

    #[tokio::test]
    async fn spawn_rejects_missing_workdir() {
        let spawner = TerminalSpawner::new(Arc::new(DeadTerminal), SessionRegistry::new());
        let err = spawner
            .spawn(SpawnRequest {
                session_id: "s1",
                command: "sleep 60",
                working_directory: Path::new("/definitely/not/a/dir"),
                label: None,
                position: WindowPosition::Unmanaged,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::WorkdirMissing(_)));
    }

    #[tokio::test]
    async fn stale_pid_file_is_deleted_before_spawn() {
        let workdir = TempDir::new().unwrap();
        let pid_file = pid_file_path(workdir.path(), "s1");
        std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
        std::fs::write(&pid_file, "99999").unwrap();

        let registry = SessionRegistry::new();
        let spawner = TerminalSpawner::new(Arc::new(ShellTerminal::new()), registry);

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

        // The stale pid must not have been read back.
        assert_ne!(session.pid, 99999);
        probe::kill_hard(session.pid).unwrap();
    }
}
