//! Terminal window scripting seam.
//!
//! The supervisor and session components never talk to a terminal
//! application directly; they go through [`TerminalControl`]. One production
//! implementation exists per OS/terminal combination — currently
//! [`AppleScriptTerminal`] for macOS Terminal.app — and tests substitute
//! their own.

mod applescript;

pub use applescript::AppleScriptTerminal;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier for a terminal window, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowId(pub String);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where to place a newly opened window on the primary screen.
///
/// Left/right resize the window to exactly half the screen. Cosmetic only;
/// a failed resize is logged and never fails the spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WindowPosition {
    #[default]
    Unmanaged,
    Left,
    Right,
}

/// Errors from the window-scripting interpreter.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The interpreter could not be launched.
    #[error("scripting interpreter failed to run: {0}")]
    Io(#[from] std::io::Error),

    /// The script ran and exited non-zero.
    #[error("script failed: {0}")]
    Failed(String),

    /// The interpreter did not return within the hard cap.
    #[error("script timed out after {0:?}")]
    Timeout(Duration),
}

/// Capability interface over one terminal application.
///
/// All operations address a window by the [`WindowId`] returned from
/// [`open_window`](TerminalControl::open_window). Implementations are
/// expected to bring the window to the front before injecting keystrokes,
/// since OS-level synthetic input always lands on the frontmost window.
#[async_trait]
pub trait TerminalControl: Send + Sync {
    /// Open a new terminal window and return its handle.
    async fn open_window(&self, position: WindowPosition) -> Result<WindowId, ScriptError>;

    /// Type literal text into the window. Must not contain newlines — the
    /// keystroke mechanism cannot express them; use
    /// [`paste_text`](TerminalControl::paste_text) instead.
    async fn type_text(&self, window: &WindowId, text: &str) -> Result<(), ScriptError>;

    /// Deliver text (possibly multi-line) via clipboard copy-then-paste.
    async fn paste_text(&self, window: &WindowId, text: &str) -> Result<(), ScriptError>;

    /// Press Enter in the window.
    async fn press_enter(&self, window: &WindowId) -> Result<(), ScriptError>;

    /// Close the window without any confirmation prompt surfacing to the
    /// user. Callers kill the hosted process first so the terminal has no
    /// reason to object.
    async fn close_window(&self, window: &WindowId) -> Result<(), ScriptError>;
}
