//! macOS Terminal.app backend.
//!
//! Terminal.app has no scripting call that creates a window, so new windows
//! are opened by sending Cmd-N through System Events and grabbing the front
//! window's id afterwards. All other operations address the window by that
//! id. Scripts run through `osascript -e` via `tokio::process::Command`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ScriptError, TerminalControl, WindowId, WindowPosition};

/// Hard cap on any single osascript round trip.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between sending Cmd-N and asking for the new front window, so the
/// window exists by the time we query it.
const WINDOW_CREATE_DELAY: Duration = Duration::from_millis(500);

pub struct AppleScriptTerminal;

impl AppleScriptTerminal {
    pub fn new() -> Self {
        Self
    }

    /// Bring the window to the front so System Events keystrokes land in it.
    async fn focus(&self, window: &WindowId) -> Result<(), ScriptError> {
        let script = format!(
            "tell application \"Terminal\"\n\
             activate\n\
             set frontmost of window id {} to true\n\
             end tell",
            window.0
        );
        run_osascript(&script).await?;
        Ok(())
    }

    /// Resize a window to half the primary screen.
    async fn apply_position(&self, window: &WindowId, position: WindowPosition) {
        if position == WindowPosition::Unmanaged {
            return;
        }

        let bounds = match run_osascript(
            "tell application \"Finder\" to get bounds of window of desktop",
        )
        .await
        {
            Ok(out) => parse_desktop_bounds(&out),
            Err(e) => {
                warn!(error = %e, "could not query screen bounds, skipping window placement");
                return;
            }
        };

        let Some(desktop) = bounds else {
            warn!("unparseable desktop bounds, skipping window placement");
            return;
        };

        let (left, top, right, bottom) = half_bounds(position, desktop);
        let script = format!(
            "tell application \"Terminal\" to set bounds of window id {} to {{{}, {}, {}, {}}}",
            window.0, left, top, right, bottom
        );
        if let Err(e) = run_osascript(&script).await {
            warn!(window = %window, error = %e, "window resize failed");
        }
    }
}

impl Default for AppleScriptTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalControl for AppleScriptTerminal {
    async fn open_window(&self, position: WindowPosition) -> Result<WindowId, ScriptError> {
        // Cmd-N, not `do script`: a keyboard shortcut is the only way to get
        // a genuinely new window (not a tab) out of Terminal.app.
        let script = format!(
            "tell application \"Terminal\" to activate\n\
             tell application \"System Events\" to keystroke \"n\" using {{command down}}\n\
             delay {}\n\
             tell application \"Terminal\" to get id of front window",
            WINDOW_CREATE_DELAY.as_secs_f64()
        );
        let out = run_osascript(&script).await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(ScriptError::Failed("front window has no id".to_string()));
        }
        debug!(window = %id, "opened terminal window");

        let window = WindowId(id);
        self.apply_position(&window, position).await;
        Ok(window)
    }

    async fn type_text(&self, window: &WindowId, text: &str) -> Result<(), ScriptError> {
        self.focus(window).await?;
        let script = format!(
            "tell application \"System Events\" to keystroke \"{}\"",
            applescript_escape(text)
        );
        run_osascript(&script).await?;
        Ok(())
    }

    async fn paste_text(&self, window: &WindowId, text: &str) -> Result<(), ScriptError> {
        self.focus(window).await?;
        let script = format!(
            "set the clipboard to \"{}\"\n\
             tell application \"System Events\" to keystroke \"v\" using {{command down}}",
            applescript_escape(text)
        );
        run_osascript(&script).await?;
        Ok(())
    }

    async fn press_enter(&self, window: &WindowId) -> Result<(), ScriptError> {
        self.focus(window).await?;
        // key code 36 is Return.
        run_osascript("tell application \"System Events\" to key code 36").await?;
        Ok(())
    }

    async fn close_window(&self, window: &WindowId) -> Result<(), ScriptError> {
        let script = format!(
            "tell application \"Terminal\" to close window id {}",
            window.0
        );
        run_osascript(&script).await?;
        Ok(())
    }
}

/// Run an inline AppleScript and return trimmed stdout.
async fn run_osascript(script: &str) -> Result<String, ScriptError> {
    let fut = Command::new("osascript").args(["-e", script]).output();
    let output = tokio::time::timeout(SCRIPT_TIMEOUT, fut)
        .await
        .map_err(|_| ScriptError::Timeout(SCRIPT_TIMEOUT))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScriptError::Failed(stderr.trim().to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Escape text for embedding inside a double-quoted AppleScript string.
fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse Finder's desktop bounds reply, e.g. `0, 0, 1920, 1080`.
fn parse_desktop_bounds(out: &str) -> Option<(i32, i32, i32, i32)> {
    let mut parts = out.split(',').map(|p| p.trim().parse::<i32>());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(l)), Some(Ok(t)), Some(Ok(r)), Some(Ok(b))) => Some((l, t, r, b)),
        _ => None,
    }
}

/// Compute the left or right half of the desktop bounds.
fn half_bounds(position: WindowPosition, desktop: (i32, i32, i32, i32)) -> (i32, i32, i32, i32) {
    let (left, top, right, bottom) = desktop;
    let mid = left + (right - left) / 2;
    match position {
        WindowPosition::Left | WindowPosition::Unmanaged => (left, top, mid, bottom),
        WindowPosition::Right => (mid, top, right, bottom),
    }
}
