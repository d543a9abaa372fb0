//! Watchdog supervisor state machine.
//!
//! Owns at most one session at a time and runs it through
//! `Idle → Running → AwaitingUserDecision | CycleTransition → …`. All state
//! mutation happens in one logical context: the owning task alternates
//! between a one-second deadline tick and the notification receiver, so the
//! session registry and watchdog fields need no locking.
//!
//! Two sentinel payloads drive transitions beyond a plain deadline reset:
//! `"End of Cycle N"` stops the session and respawns it for cycle N+1, and
//! `"Plan Fully Executed"` shuts the plan down. Everything else is a
//! heartbeat that resets the deadline to `receipt + timeout` (absolute, not
//! additive).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::Notification;
use crate::config::{PromptConfig, WatchdogConfig};
use crate::probe;
use crate::session::{
    ForcefulTerminator, Session, SessionRegistry, SpawnRequest, TerminalSpawner, TextInjector,
};
use crate::terminal::WindowPosition;

/// Deadline evaluation tick. Expiry detection latency is bounded by this.
pub const TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Sentinels
// ============================================================================

/// Prefix of the cycle-end sentinel; the remainder must parse as an integer.
pub const CYCLE_END_PREFIX: &str = "End of Cycle ";

/// Exact payload that completes the plan.
pub const PLAN_COMPLETE_PAYLOAD: &str = "Plan Fully Executed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// `"End of Cycle N"` — the session finished cycle N.
    CycleEnd(u32),
    /// `"Plan Fully Executed"` — the whole plan is done.
    PlanComplete,
    /// Anything else, including a cycle-end sentinel with a non-integer
    /// suffix (logged as malformed).
    Heartbeat,
}

/// Classify an inbound payload.
pub fn classify_payload(payload: &str) -> Sentinel {
    if payload == PLAN_COMPLETE_PAYLOAD {
        return Sentinel::PlanComplete;
    }
    if let Some(rest) = payload.strip_prefix(CYCLE_END_PREFIX) {
        match rest.trim().parse::<u32>() {
            Ok(n) => return Sentinel::CycleEnd(n),
            Err(_) => {
                warn!(payload = %payload, "malformed cycle-end sentinel, treating as heartbeat");
                return Sentinel::Heartbeat;
            }
        }
    }
    Sentinel::Heartbeat
}

// ============================================================================
// Decision seam
// ============================================================================

/// Evidence presented when the deadline expires.
#[derive(Debug, Clone)]
pub struct TimeoutEvidence {
    pub session_id: String,
    pub pid: u32,
    pub cycle: u32,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Time since the session started.
    pub elapsed: Duration,
}

/// The three resolutions of a watchdog timeout. All are valid outcomes,
/// none is a failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Terminate the session now.
    Terminate,
    /// Extend the deadline by the configured interval.
    Extend,
    /// Disable the deadline for this session entirely.
    Disable,
}

/// Answers the timeout prompt. The binary implements this over stdin; a GUI
/// would block on a dialog.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, evidence: &TimeoutEvidence) -> TimeoutDecision;
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    AwaitingUserDecision,
    CycleTransition,
}

/// What to run, identically for every cycle of the plan.
#[derive(Debug, Clone)]
pub struct PlanSpec {
    /// Base for per-cycle session ids (`<base>-c<cycle>`).
    pub session_base: String,
    pub command: String,
    pub working_directory: PathBuf,
    pub label: Option<String>,
    pub position: WindowPosition,
}

impl PlanSpec {
    fn session_id(&self, cycle: u32) -> String {
        format!("{}-c{}", self.session_base, cycle)
    }
}

pub struct WatchdogSupervisor {
    spawner: TerminalSpawner,
    injector: TextInjector,
    terminator: ForcefulTerminator,
    registry: SessionRegistry,
    decisions: Arc<dyn DecisionProvider>,
    watchdog: WatchdogConfig,
    prompts: PromptConfig,
    plan: PlanSpec,

    state: SupervisorState,
    session: Option<Session>,
    /// `None` while the watchdog is disabled or no session is active.
    deadline: Option<Instant>,
    watchdog_enabled: bool,
    cycle_number: u32,
    plan_active: bool,
    last_message: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    session_started_at: Option<Instant>,
}

impl WatchdogSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spawner: TerminalSpawner,
        injector: TextInjector,
        terminator: ForcefulTerminator,
        registry: SessionRegistry,
        decisions: Arc<dyn DecisionProvider>,
        watchdog: WatchdogConfig,
        prompts: PromptConfig,
        plan: PlanSpec,
    ) -> Self {
        Self {
            spawner,
            injector,
            terminator,
            registry,
            decisions,
            watchdog,
            prompts,
            plan,
            state: SupervisorState::Idle,
            session: None,
            deadline: None,
            watchdog_enabled: true,
            cycle_number: 0,
            plan_active: false,
            last_message: None,
            last_message_at: None,
            session_started_at: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn cycle_number(&self) -> u32 {
        self.cycle_number
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    pub fn plan_active(&self) -> bool {
        self.plan_active
    }

    /// Start the plan: spawn the cycle-1 session and inject the
    /// start-from-the-beginning instruction.
    pub async fn start_plan(&mut self) {
        if self.state != SupervisorState::Idle {
            warn!(state = ?self.state, "start_plan ignored, plan already active");
            return;
        }
        self.plan_active = true;
        self.last_message = None;
        self.last_message_at = None;
        self.start_cycle(1).await;
    }

    /// Process one inbound notification.
    pub async fn handle_notification(&mut self, notification: Notification) {
        if self.state != SupervisorState::Running {
            debug!(state = ?self.state, payload = %notification.payload, "notification ignored");
            return;
        }

        self.last_message = Some(notification.payload.clone());
        self.last_message_at = Some(notification.received_wall);

        match classify_payload(&notification.payload) {
            Sentinel::Heartbeat => {
                if self.watchdog_enabled {
                    // Absolute reset: receipt time + timeout, regardless of
                    // how much time remained.
                    self.deadline = Some(notification.received_at + self.watchdog.timeout());
                }
                debug!(payload = %notification.payload, "heartbeat, deadline reset");
            }
            Sentinel::CycleEnd(ended) => match ended.checked_add(1) {
                Some(next) => {
                    info!(cycle = ended, "cycle complete, restarting session");
                    self.state = SupervisorState::CycleTransition;
                    self.stop_session().await;
                    tokio::time::sleep(self.watchdog.cycle_delay()).await;
                    self.start_cycle(next).await;
                }
                None => {
                    // A socket-delivered payload must not be able to wrap
                    // the cycle counter.
                    warn!(cycle = ended, "cycle counter exhausted, treating as heartbeat");
                    if self.watchdog_enabled {
                        self.deadline = Some(notification.received_at + self.watchdog.timeout());
                    }
                }
            },
            Sentinel::PlanComplete => {
                info!("plan fully executed, shutting session down");
                self.stop_session().await;
                self.cycle_number = 0;
                self.plan_active = false;
                self.state = SupervisorState::Idle;
            }
        }
    }

    /// One deadline-evaluation tick.
    ///
    /// Sweeps a dead session out of the registry, then checks the deadline.
    /// On expiry, blocks on the decision provider and applies whichever of
    /// the three resolutions it returns.
    pub async fn tick(&mut self) {
        if self.state != SupervisorState::Running {
            return;
        }

        if let Some(session) = &self.session
            && !probe::is_alive(session.pid)
        {
            warn!(
                session = %session.session_id,
                pid = session.pid,
                "session process died, evicting"
            );
            self.registry.remove(&session.session_id);
            self.session = None;
            self.deadline = None;
            self.plan_active = false;
            self.state = SupervisorState::Idle;
            return;
        }

        let Some(deadline) = self.deadline else {
            return;
        };
        if !self.watchdog_enabled || Instant::now() < deadline {
            return;
        }

        self.state = SupervisorState::AwaitingUserDecision;
        let evidence = self.evidence();
        info!(
            session = %evidence.session_id,
            elapsed_secs = evidence.elapsed.as_secs(),
            "watchdog deadline expired, asking for a decision"
        );

        match self.decisions.decide(&evidence).await {
            TimeoutDecision::Terminate => {
                info!("decision: terminate");
                self.stop_session().await;
                self.plan_active = false;
                self.state = SupervisorState::Idle;
            }
            TimeoutDecision::Extend => {
                let deadline = Instant::now() + self.watchdog.extension();
                info!(extension_secs = self.watchdog.extension_seconds, "decision: extend");
                self.deadline = Some(deadline);
                self.state = SupervisorState::Running;
            }
            TimeoutDecision::Disable => {
                info!("decision: watchdog disabled for this session");
                self.watchdog_enabled = false;
                self.deadline = None;
                self.state = SupervisorState::Running;
            }
        }
    }

    /// Terminate the active session (if any) and go idle.
    pub async fn shutdown(&mut self) {
        self.stop_session().await;
        self.plan_active = false;
        self.state = SupervisorState::Idle;
    }

    /// Drive the supervisor until the shutdown signal fires.
    ///
    /// Spawn/inject/terminate run inline and block the tick for their
    /// duration; that is acceptable because they only happen on rare state
    /// transitions, not on every tick.
    pub async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Self {
        self.start_plan().await;

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    self.shutdown().await;
                    break;
                }
                received = notifications.recv() => {
                    match received {
                        Some(n) => self.handle_notification(n).await,
                        None => {
                            warn!("notification channel closed, shutting down");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                _ = tick.tick() => self.tick().await,
            }
        }

        self
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Spawn the session for `cycle` and inject its startup instruction.
    ///
    /// A failed spawn is logged and leaves the supervisor idle with no
    /// session — never a half-initialized one. The operator restarts
    /// manually; spawn errors are not auto-retried.
    async fn start_cycle(&mut self, cycle: u32) {
        let session_id = self.plan.session_id(cycle);
        let spawned = self
            .spawner
            .spawn(SpawnRequest {
                session_id: &session_id,
                command: &self.plan.command,
                working_directory: &self.plan.working_directory,
                label: self.plan.label.as_deref(),
                position: self.plan.position,
            })
            .await;

        let session = match spawned {
            Ok(s) => s,
            Err(e) => {
                error!(session = %session_id, cycle, error = %e, "spawn failed, going idle");
                self.session = None;
                self.deadline = None;
                self.state = SupervisorState::Idle;
                return;
            }
        };

        info!(session = %session_id, cycle, pid = session.pid, "session started");

        let prompt = self.prompts.for_cycle(cycle);
        if !self.injector.inject(&session.window, &prompt, true).await {
            // Session stays tracked; it is alive but may be idle waiting
            // for input.
            warn!(session = %session_id, "startup instruction injection failed");
        }

        self.cycle_number = cycle;
        self.watchdog_enabled = true;
        self.deadline = Some(Instant::now() + self.watchdog.timeout());
        self.session_started_at = Some(Instant::now());
        self.session = Some(session);
        self.state = SupervisorState::Running;
    }

    async fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.terminator.terminate(&session).await;
        }
        self.deadline = None;
        self.session_started_at = None;
    }

    fn evidence(&self) -> TimeoutEvidence {
        let (session_id, pid) = self
            .session
            .as_ref()
            .map(|s| (s.session_id.clone(), s.pid))
            .unwrap_or_default();
        TimeoutEvidence {
            session_id,
            pid,
            cycle: self.cycle_number,
            last_message: self.last_message.clone(),
            last_message_at: self.last_message_at,
            elapsed: self
                .session_started_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
        }
    }
}
