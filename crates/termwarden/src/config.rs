use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub injection: InjectionConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// WatchdogConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds of silence before the timeout decision prompt.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Seconds added to the deadline when the operator picks "extend".
    #[serde(default = "default_extension")]
    pub extension_seconds: u64,
    /// Pause between terminating a finished cycle and spawning the next one.
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay_seconds: u64,
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn extension(&self) -> Duration {
        Duration::from_secs(self.extension_seconds)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_seconds)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            extension_seconds: default_extension(),
            cycle_delay_seconds: default_cycle_delay(),
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_extension() -> u64 {
    120
}

fn default_cycle_delay() -> u64 {
    5
}

// ============================================================================
// InjectionConfig
// ============================================================================

/// Timing knobs for keystroke injection.
///
/// These defaults were tuned against a target program that needs a long
/// warm-up before it accepts input and silently drops keystrokes above an
/// undocumented rate. There is no readiness signal to poll, so the sleeps
/// are the contract.
#[derive(Debug, Deserialize)]
pub struct InjectionConfig {
    /// Seconds to wait after spawn before the target accepts any input.
    #[serde(default = "default_warmup")]
    pub warmup_seconds: f64,
    /// Maximum characters typed per scripting call.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// Milliseconds between chunks.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Milliseconds between the last typed chunk and the Enter keypress.
    #[serde(default = "default_settle_typed_ms")]
    pub settle_typed_ms: u64,
    /// Milliseconds between a clipboard paste and the Enter keypress.
    /// Longer than the typed settle because pastes buffer asynchronously.
    #[serde(default = "default_settle_paste_ms")]
    pub settle_paste_ms: u64,
    /// Seconds before a single injection scripting call is abandoned.
    /// Tighter than the interpreter's own timeout so a stalled call cannot
    /// wedge the whole injection.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
}

impl InjectionConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64(self.warmup_seconds)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn settle_typed(&self) -> Duration {
        Duration::from_millis(self.settle_typed_ms)
    }

    pub fn settle_paste(&self) -> Duration {
        Duration::from_millis(self.settle_paste_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            warmup_seconds: default_warmup(),
            chunk_chars: default_chunk_chars(),
            chunk_delay_ms: default_chunk_delay_ms(),
            settle_typed_ms: default_settle_typed_ms(),
            settle_paste_ms: default_settle_paste_ms(),
            call_timeout_seconds: default_call_timeout(),
        }
    }
}

fn default_warmup() -> f64 {
    8.0
}

fn default_chunk_chars() -> usize {
    100
}

fn default_chunk_delay_ms() -> u64 {
    200
}

fn default_settle_typed_ms() -> u64 {
    500
}

fn default_settle_paste_ms() -> u64 {
    1500
}

fn default_call_timeout() -> u64 {
    10
}

// ============================================================================
// PromptConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PromptConfig {
    /// Startup instruction injected on cycle 1.
    #[serde(default = "default_start_prompt")]
    pub start_cycle: String,
    /// Startup instruction injected on cycle N > 1. `{cycle}` is replaced
    /// with the cycle number.
    #[serde(default = "default_continue_prompt")]
    pub continue_cycle: String,
}

impl PromptConfig {
    /// Render the startup instruction for the given cycle number.
    pub fn for_cycle(&self, cycle: u32) -> String {
        let template = if cycle <= 1 {
            &self.start_cycle
        } else {
            &self.continue_cycle
        };
        template.replace("{cycle}", &cycle.to_string())
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            start_cycle: default_start_prompt(),
            continue_cycle: default_continue_prompt(),
        }
    }
}

fn default_start_prompt() -> String {
    "Start the plan from the beginning. Report progress after every step."
        .to_string()
}

fn default_continue_prompt() -> String {
    "This is cycle {cycle}. Continue the plan from the recorded next step. \
     Report progress after every step."
        .to_string()
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================
