//! Run a command under watchdog supervision from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use termwarden::channel::NotificationChannel;
use termwarden::config::Config;
use termwarden::session::{ForcefulTerminator, SessionRegistry, TerminalSpawner, TextInjector};
use termwarden::terminal::{AppleScriptTerminal, WindowPosition};
use termwarden::watchdog::{
    DecisionProvider, PlanSpec, TimeoutDecision, TimeoutEvidence, WatchdogSupervisor,
};

#[derive(Parser)]
#[command(name = "termwarden", about = "Watchdog supervisor for terminal-hosted CLI agent sessions")]
struct Cli {
    /// Command to run inside the spawned terminal window.
    command: String,

    /// Working directory for the session.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Config file (YAML). Missing file means defaults.
    #[arg(long, default_value = "termwarden.yaml")]
    config: PathBuf,

    /// Override the watchdog timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Session label shown in logs.
    #[arg(long)]
    label: Option<String>,

    /// Place the window on a half of the primary screen.
    #[arg(long, value_enum, default_value = "unmanaged")]
    position: WindowPosition,
}

/// Answers timeout prompts on stdin.
struct StdinDecisions;

#[async_trait]
impl DecisionProvider for StdinDecisions {
    async fn decide(&self, evidence: &TimeoutEvidence) -> TimeoutDecision {
        println!();
        println!("Watchdog deadline expired.");
        println!("  session:      {}", evidence.session_id);
        println!("  pid:          {}", evidence.pid);
        println!("  cycle:        {}", evidence.cycle);
        println!("  elapsed:      {}s", evidence.elapsed.as_secs());
        match (&evidence.last_message, evidence.last_message_at) {
            (Some(msg), Some(at)) => println!("  last message: {:?} at {}", msg, at.to_rfc3339()),
            _ => println!("  last message: (none received)"),
        }
        println!("[t]erminate now, [e]xtend the deadline, or [d]isable the watchdog?");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                // Stdin closed: terminating is the only safe resolution.
                Ok(None) | Err(_) => return TimeoutDecision::Terminate,
            };
            match line.trim().to_lowercase().as_str() {
                "t" | "terminate" => return TimeoutDecision::Terminate,
                "e" | "extend" => return TimeoutDecision::Extend,
                "d" | "disable" => return TimeoutDecision::Disable,
                other => println!("unrecognized choice {:?}; enter t, e, or d", other),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .await
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(timeout) = cli.timeout {
        config.watchdog.timeout_seconds = timeout;
    }

    let workdir = cli
        .workdir
        .canonicalize()
        .with_context(|| format!("resolving workdir {}", cli.workdir.display()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let socket_path = NotificationChannel::default_path();
    let channel = NotificationChannel::bind(socket_path.clone(), tx)
        .context("binding notification channel")?;
    info!(path = %socket_path.display(), "notification channel ready");

    let terminal = Arc::new(AppleScriptTerminal::new());
    let registry = SessionRegistry::new();
    let supervisor = WatchdogSupervisor::new(
        TerminalSpawner::new(terminal.clone(), registry.clone()),
        TextInjector::new(terminal.clone(), config.injection),
        ForcefulTerminator::new(terminal.clone(), registry.clone()),
        registry,
        Arc::new(StdinDecisions),
        config.watchdog,
        config.prompts,
        PlanSpec {
            session_base: format!("warden-{}", ulid::Ulid::new().to_string().to_lowercase()),
            command: cli.command,
            working_directory: workdir,
            label: cli.label,
            position: cli.position,
        },
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let supervisor_task = tokio::spawn(supervisor.run(rx, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received, stopping supervisor");
    if shutdown_tx.send(()).is_err() {
        warn!("supervisor already stopped");
    }

    let supervisor = supervisor_task.await.context("joining supervisor task")?;
    if supervisor.session().is_some() {
        warn!("supervisor exited with a session still tracked");
    }
    channel.shutdown().await;

    Ok(())
}
