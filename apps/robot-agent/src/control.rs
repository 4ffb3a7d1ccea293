//! Control-plane admission: scope checks, rate limiting, and the upstream
//! trigger sources for the safety monitor.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use chainkvm_auth::scope;
use chainkvm_proto::ControlCommand;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::safety::{SafetyMonitor, SafetyTrigger};
use crate::session::{SessionManager, SessionState};

#[derive(Debug, Error)]
pub enum ControlReject {
    #[error("control frame is not valid json")]
    Malformed,
    #[error("missing scope {0}")]
    MissingScope(String),
    #[error("rate limit exceeded")]
    RateLimited,
}

fn required_scope(command: &ControlCommand) -> Option<&'static str> {
    match command {
        ControlCommand::Drive { .. } => Some(scope::CONTROL),
        ControlCommand::EStop { .. } => Some(scope::ESTOP),
        ControlCommand::Ping { .. } => None,
    }
}

fn bypasses_rate_limit(command: &ControlCommand) -> bool {
    matches!(command, ControlCommand::EStop { .. })
}

/// Fixed-window command rate limiter. Deliberately coarse; its only job is
/// to keep a misbehaving console from saturating the actuator queue.
struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        if state.0.elapsed() > self.window {
            *state = (Instant::now(), 0);
        }
        if state.1 >= self.max_per_window {
            return false;
        }
        state.1 += 1;
        true
    }
}

/// Admits or rejects every inbound control frame before dispatch.
///
/// Schema-invalid and unauthorized frames accumulate toward the
/// `InvalidCmds` safety trigger; rate-limited frames do not, since a fast
/// console is not an adversarial one. `e_stop` bypasses the limiter
/// entirely.
pub struct ControlGate {
    session: Arc<SessionManager>,
    safety: Arc<SafetyMonitor>,
    watchdog: Arc<ControlLossWatchdog>,
    rate: RateLimiter,
    invalid_threshold: u32,
    invalid_count: AtomicU32,
}

impl ControlGate {
    pub fn new(
        session: Arc<SessionManager>,
        safety: Arc<SafetyMonitor>,
        watchdog: Arc<ControlLossWatchdog>,
        invalid_threshold: u32,
        max_cmds_per_sec: u32,
    ) -> Self {
        Self {
            session,
            safety,
            watchdog,
            rate: RateLimiter::new(max_cmds_per_sec, Duration::from_secs(1)),
            invalid_threshold,
            invalid_count: AtomicU32::new(0),
        }
    }

    /// Authorize one raw control frame. On success the command is ready for
    /// dispatch to the hardware layer (dispatch itself lives there).
    pub async fn admit(&self, raw: &str) -> Result<ControlCommand, ControlReject> {
        let command: ControlCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(err) => {
                debug!(target: "agent::control", error = %err, "rejecting malformed control frame");
                self.record_invalid().await;
                return Err(ControlReject::Malformed);
            }
        };

        if let Some(scope) = required_scope(&command) {
            if !self.session.has_scope(scope) {
                warn!(
                    target: "agent::control",
                    command = command.kind(),
                    scope,
                    "rejecting unauthorized control command"
                );
                self.record_invalid().await;
                return Err(ControlReject::MissingScope(scope.to_string()));
            }
        }

        if !bypasses_rate_limit(&command) && !self.rate.allow() {
            return Err(ControlReject::RateLimited);
        }

        self.watchdog.feed();
        Ok(command)
    }

    /// Start a fresh session's invalid-command budget. Called on activation
    /// so garbage counted against an earlier connection cannot trip the
    /// safe stop on the new one's first bad frame.
    pub fn reset_invalid_count(&self) {
        self.invalid_count.store(0, Ordering::SeqCst);
    }

    async fn record_invalid(&self) {
        let count = self.invalid_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.invalid_threshold {
            self.invalid_count.store(0, Ordering::SeqCst);
            warn!(
                target: "agent::control",
                count,
                "invalid command threshold crossed"
            );
            let _ = self.safety.trigger(SafetyTrigger::InvalidCmds).await;
        }
    }
}

/// Fires the `ControlLoss` trigger when no valid control frame arrives
/// within the configured window.
///
/// Armed on session activation and disarmed on termination; the monitor
/// itself never decides when loss has occurred, it only reacts once this
/// watchdog says so.
pub struct ControlLossWatchdog {
    window: Duration,
    last_seen: Mutex<Instant>,
    armed: AtomicBool,
}

impl ControlLossWatchdog {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            window,
            last_seen: Mutex::new(Instant::now()),
            armed: AtomicBool::new(false),
        })
    }

    pub fn feed(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn arm(&self) {
        self.feed();
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn spawn(
        self: &Arc<Self>,
        session: Arc<SessionManager>,
        safety: Arc<SafetyMonitor>,
    ) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let tick = (watchdog.window / 4).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if !watchdog.armed.load(Ordering::SeqCst) {
                    continue;
                }
                // Arm/disarm can race through termination paths; the session
                // state is authoritative. A watchdog left armed with no
                // active session disarms itself instead of firing.
                if session.state() != SessionState::Active {
                    watchdog.disarm();
                    continue;
                }
                let elapsed = watchdog.last_seen.lock().elapsed();
                if elapsed > watchdog.window {
                    watchdog.disarm();
                    warn!(
                        target: "agent::control",
                        elapsed_ms = elapsed.as_millis() as u64,
                        "control channel silent past window"
                    );
                    let _ = safety.trigger(SafetyTrigger::ControlLoss).await;
                }
            }
        })
    }
}

/// Polls the active session's token expiry and, once passed, terminates the
/// session and fires the `TokenExpired` trigger.
pub fn spawn_expiry_watchdog(
    session: Arc<SessionManager>,
    safety: Arc<SafetyMonitor>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            let Some(info) = session.info() else { continue };
            if chainkvm_auth::unix_now() >= info.expires_at {
                warn!(
                    target: "agent::session",
                    session_id = %info.session_id,
                    "capability token expired"
                );
                session.terminate();
                let _ = safety.trigger(SafetyTrigger::TokenExpired).await;
            }
        }
    })
}
