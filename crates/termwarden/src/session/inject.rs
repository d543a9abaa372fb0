//! Keystroke injection into a spawned session.
//!
//! Best effort by contract: every failure is logged and reported as `false`,
//! never raised. A failed injection means the session is alive but may be
//! sitting idle waiting for input; the caller decides what to do about that.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::InjectionConfig;
use crate::terminal::{ScriptError, TerminalControl, WindowId};

pub struct TextInjector {
    terminal: Arc<dyn TerminalControl>,
    config: InjectionConfig,
}

impl TextInjector {
    pub fn new(terminal: Arc<dyn TerminalControl>, config: InjectionConfig) -> Self {
        Self { terminal, config }
    }

    /// Deliver `text` into the window, then press Enter if `submit`.
    ///
    /// Blocks through the configured warm-up before the first keystroke —
    /// the target program drops input sent too early and exposes no
    /// readiness signal to poll. Multi-line payloads go through clipboard
    /// paste because the keystroke mechanism cannot express embedded
    /// newlines; single-line text is typed in bounded chunks because the
    /// mechanism silently drops characters above an undocumented rate.
    pub async fn inject(&self, window: &WindowId, text: &str, submit: bool) -> bool {
        tokio::time::sleep(self.config.warmup()).await;

        let pasted = text.contains('\n');
        let delivered = if pasted {
            self.capped(self.terminal.paste_text(window, text)).await
        } else {
            self.type_chunked(window, text).await
        };

        if let Err(e) = delivered {
            warn!(window = %window, error = %e, "text injection failed");
            return false;
        }

        if submit {
            let settle = if pasted {
                self.config.settle_paste()
            } else {
                self.config.settle_typed()
            };
            tokio::time::sleep(settle).await;

            if let Err(e) = self.capped(self.terminal.press_enter(window)).await {
                warn!(window = %window, error = %e, "submit keypress failed");
                return false;
            }
        }

        debug!(window = %window, chars = text.len(), pasted, "injected text");
        true
    }

    async fn type_chunked(&self, window: &WindowId, text: &str) -> Result<(), ScriptError> {
        let chunks = chunk_text(text, self.config.chunk_chars);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            self.capped(self.terminal.type_text(window, chunk)).await?;
            // Delay between chunks, not after the last one.
            if i < last {
                tokio::time::sleep(self.config.chunk_delay()).await;
            }
        }
        Ok(())
    }

    /// Cap one scripting call so a stalled interpreter cannot wedge the
    /// whole injection.
    async fn capped<T>(
        &self,
        call: impl Future<Output = Result<T, ScriptError>>,
    ) -> Result<T, ScriptError> {
        tokio::time::timeout(self.config.call_timeout(), call)
            .await
            .map_err(|_| ScriptError::Timeout(self.config.call_timeout()))?
    }
}

/// Split text into chunks of at most `max_chars` characters, respecting
/// char boundaries.
pub(crate) fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count >= max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
