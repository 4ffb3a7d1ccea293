//! Safe-stop state machine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chainkvm_proto::StateNotification;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// The five independent sources that can demand a safe stop.
///
/// Priority resolves which trigger is *reported* as the cause when several
/// fire in one episode; the halt itself is unconditional. Lower number wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyTrigger {
    /// Operator pressed the emergency stop.
    EStop,
    /// Gateway revoked the session out-of-band.
    Revoked,
    /// The capability token passed its expiry.
    TokenExpired,
    /// No control traffic within the configured window.
    ControlLoss,
    /// Too many schema-invalid or unauthorized commands.
    InvalidCmds,
}

impl SafetyTrigger {
    pub fn priority(self) -> u8 {
        match self {
            SafetyTrigger::EStop => 0,
            SafetyTrigger::Revoked => 1,
            SafetyTrigger::TokenExpired => 2,
            SafetyTrigger::ControlLoss => 3,
            SafetyTrigger::InvalidCmds => 4,
        }
    }

    /// Whether the session may continue after the condition clears. A
    /// non-recoverable trigger always ends the session.
    pub fn recoverable(self) -> bool {
        matches!(self, SafetyTrigger::ControlLoss | SafetyTrigger::InvalidCmds)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SafetyTrigger::EStop => "e_stop",
            SafetyTrigger::Revoked => "revoked",
            SafetyTrigger::TokenExpired => "token_expired",
            SafetyTrigger::ControlLoss => "control_loss",
            SafetyTrigger::InvalidCmds => "invalid_commands",
        }
    }
}

impl fmt::Display for SafetyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one completed safe-stop episode.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub trigger: SafetyTrigger,
    pub completed_at: SystemTime,
    /// Full trigger → halt-issued → notification-sent span.
    pub duration: Duration,
    /// A failed hardware halt is reported here, never swallowed.
    pub halt_error: Option<String>,
}

impl TransitionResult {
    pub fn succeeded(&self) -> bool {
        self.halt_error.is_none()
    }
}

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("hardware stop handler not wired")]
    StopUnavailable,
    #[error("hardware stop failed: {0}")]
    StopFailed(String),
}

/// The robot hardware's stop interface. Implementations must be idempotent;
/// the monitor guarantees at most one call per episode regardless.
#[async_trait]
pub trait RobotStopper: Send + Sync {
    async fn halt(&self) -> Result<(), SafetyError>;
}

/// Sink for audit events the monitor itself is responsible for. Only
/// `InvalidCmds`-class episodes are audited here; other triggers are audited
/// by their originating component.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, trigger: SafetyTrigger, detail: &str);
}

enum Latch {
    Armed,
    Stopped(TransitionResult),
}

/// Single-writer safe-stop machine.
///
/// The latch mutex is held across the halt call, so concurrent triggers
/// serialize: the first caller executes the hardware stop, every later
/// caller observes the stopped latch and returns without issuing a second
/// command. `reset()` re-arms the latch once a new session goes active.
pub struct SafetyMonitor {
    stopper: Option<Arc<dyn RobotStopper>>,
    audit: Option<Arc<dyn AuditSink>>,
    notifications: mpsc::UnboundedSender<StateNotification>,
    latch: tokio::sync::Mutex<Latch>,
}

impl SafetyMonitor {
    pub fn new(
        stopper: Option<Arc<dyn RobotStopper>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> (Self, mpsc::UnboundedReceiver<StateNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                stopper,
                audit,
                notifications: tx,
                latch: tokio::sync::Mutex::new(Latch::Armed),
            },
            rx,
        )
    }

    /// Drive the robot to a safe stop on behalf of `trigger`.
    ///
    /// Returns `Some(result)` for the caller that won the episode and `None`
    /// for every caller that arrived after the latch was already tripped.
    pub async fn trigger(&self, trigger: SafetyTrigger) -> Option<TransitionResult> {
        let mut latch = self.latch.lock().await;
        if let Latch::Stopped(existing) = &*latch {
            debug!(
                target: "agent::safety",
                trigger = %trigger,
                cause = %existing.trigger,
                "safe stop already executed for this episode"
            );
            return None;
        }

        let started = Instant::now();
        let halt_error = match &self.stopper {
            Some(stopper) => stopper.halt().await.err().map(|err| err.to_string()),
            None => Some(SafetyError::StopUnavailable.to_string()),
        };

        let frame = match &halt_error {
            None => StateNotification::SafeStop {
                trigger: trigger.as_str().to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Some(err) => StateNotification::SafeStopFailed {
                trigger: trigger.as_str().to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: err.clone(),
            },
        };
        let _ = self.notifications.send(frame);

        if trigger == SafetyTrigger::InvalidCmds {
            if let Some(audit) = &self.audit {
                audit
                    .publish(trigger, "invalid command threshold exceeded")
                    .await;
            }
        }

        let result = TransitionResult {
            trigger,
            completed_at: SystemTime::now(),
            duration: started.elapsed(),
            halt_error,
        };
        match &result.halt_error {
            None => warn!(
                target: "agent::safety",
                trigger = %trigger,
                duration_ms = result.duration.as_millis() as u64,
                "safe stop executed"
            ),
            Some(err) => error!(
                target: "agent::safety",
                trigger = %trigger,
                error = %err,
                "safe stop FAILED; robot may still be moving"
            ),
        }
        *latch = Latch::Stopped(result.clone());
        Some(result)
    }

    /// Re-arm after a new session becomes active.
    pub async fn reset(&self) {
        *self.latch.lock().await = Latch::Armed;
    }

    pub async fn is_stopped(&self) -> bool {
        matches!(&*self.latch.lock().await, Latch::Stopped(_))
    }

    pub async fn last_result(&self) -> Option<TransitionResult> {
        match &*self.latch.lock().await {
            Latch::Stopped(result) => Some(result.clone()),
            Latch::Armed => None,
        }
    }
}
