//! The agent itself: wires signaling frames into the session, safety, and
//! control subsystems, and speaks to the media transport through a trait so
//! the WebRTC stack stays replaceable.

use std::sync::Arc;

use async_trait::async_trait;
use chainkvm_auth::TokenError;
use chainkvm_proto::{IceCandidate, SignalErrorCode, SignalMessage};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::control::{ControlGate, ControlLossWatchdog, ControlReject};
use crate::safety::{SafetyMonitor, SafetyTrigger};
use crate::session::{SessionError, SessionInfo, SessionManager, SessionState};
use crate::signaling::{SignalHandler, SignalingClient};
use chainkvm_proto::ControlCommand;

/// The media-plane transport (WebRTC peer connection and data channel).
///
/// The agent never touches SDP or ICE beyond ferrying it; negotiation and
/// teardown are the implementation's problem.
#[async_trait]
pub trait TeleopTransport: Send + Sync {
    /// Accept the operator's offer and produce the answer SDP.
    async fn answer_offer(&self, session_id: &str, sdp: &str) -> anyhow::Result<String>;
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Glue between the signaling channel and everything below it.
///
/// One agent hosts at most one session at a time. An offer is only answered
/// after its capability token validates for the offered session id; the
/// session goes `Active` when the transport reports the peer connected, not
/// when the answer is sent.
pub struct RobotAgent {
    robot_id: String,
    session: Arc<SessionManager>,
    safety: Arc<SafetyMonitor>,
    transport: Arc<dyn TeleopTransport>,
    watchdog: Arc<ControlLossWatchdog>,
    gate: ControlGate,
    /// Validated but not yet connected session, parked between the answer
    /// and the transport's connected callback.
    pending: Mutex<Option<SessionInfo>>,
    signaling: Mutex<Option<Arc<SignalingClient>>>,
}

impl RobotAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        robot_id: impl Into<String>,
        session: Arc<SessionManager>,
        safety: Arc<SafetyMonitor>,
        transport: Arc<dyn TeleopTransport>,
        watchdog: Arc<ControlLossWatchdog>,
        invalid_cmd_threshold: u32,
        max_cmds_per_sec: u32,
    ) -> Self {
        let gate = ControlGate::new(
            session.clone(),
            safety.clone(),
            watchdog.clone(),
            invalid_cmd_threshold,
            max_cmds_per_sec,
        );
        Self {
            robot_id: robot_id.into(),
            session,
            safety,
            transport,
            watchdog,
            gate,
            pending: Mutex::new(None),
            signaling: Mutex::new(None),
        }
    }

    pub fn attach_signaling(&self, client: Arc<SignalingClient>) {
        *self.signaling.lock() = Some(client);
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// Called by the transport once the peer connection is up. Promotes the
    /// pending session to `Active`, re-arms safety, and starts the control
    /// loss watchdog.
    pub async fn on_transport_connected(&self) {
        let Some(info) = self.pending.lock().take() else {
            warn!(target: "agent::core", "transport connected with no pending session");
            return;
        };
        let session_id = info.session_id.clone();
        if let Err(err) = self.session.activate(info) {
            warn!(target: "agent::core", session_id = %session_id, error = %err, "activation rejected");
            return;
        }
        self.gate.reset_invalid_count();
        self.safety.reset().await;
        self.watchdog.arm();
    }

    /// Entry point for raw frames off the control data channel.
    pub async fn handle_control_frame(&self, raw: &str) -> Result<ControlCommand, ControlReject> {
        let command = self.gate.admit(raw).await?;
        if let ControlCommand::EStop { seq } = command {
            info!(target: "agent::core", seq, "operator e-stop");
            let _ = self.safety.trigger(SafetyTrigger::EStop).await;
            self.session.terminate();
        }
        Ok(command)
    }

    fn send_signal(&self, message: SignalMessage) {
        let client = self.signaling.lock().clone();
        match client {
            Some(client) => {
                if let Err(err) = client.send(message) {
                    warn!(target: "agent::core", error = %err, "failed to send signaling frame");
                }
            }
            None => debug!(target: "agent::core", "no signaling client attached; frame dropped"),
        }
    }

    fn send_error(&self, code: SignalErrorCode, message: impl Into<String>) {
        self.send_signal(SignalMessage::Error {
            code,
            message: message.into(),
        });
    }

    fn reject_offer(&self, session_id: &str, err: &SessionError) {
        let code = match err {
            SessionError::Token(TokenError::SessionMismatch) => SignalErrorCode::SessionMismatch,
            SessionError::Token(TokenError::Malformed)
            | SessionError::Token(TokenError::InvalidSignature) => SignalErrorCode::InvalidToken,
            _ => SignalErrorCode::TokenInvalid,
        };
        warn!(
            target: "agent::core",
            session_id,
            error = %err,
            "rejecting offer"
        );
        self.send_error(code, err.to_string());
    }
}

#[async_trait]
impl SignalHandler for RobotAgent {
    async fn on_offer(&self, session_id: &str, sdp: &str, token: Option<&str>) {
        // A clean hangup leaves the safety latch armed; only then may a new
        // offer re-arm the manager. Any latched episode (revocation, e-stop,
        // expiry) keeps the agent terminated until restart.
        if self.session.state() == SessionState::Terminated && !self.safety.is_stopped().await {
            info!(target: "agent::core", session_id, "re-arming session manager after hangup");
            self.session.reset();
        }

        let Some(token) = token else {
            warn!(target: "agent::core", session_id, "offer without capability token");
            self.send_error(SignalErrorCode::MissingToken, "offer carried no token");
            return;
        };

        let info = match self.session.validate_token(session_id, token).await {
            Ok(info) => info,
            Err(err) => {
                self.reject_offer(session_id, &err);
                return;
            }
        };

        info!(
            target: "agent::core",
            session_id,
            operator = %info.operator,
            "offer authorized"
        );

        match self.transport.answer_offer(session_id, sdp).await {
            Ok(answer) => {
                *self.pending.lock() = Some(info);
                self.send_signal(SignalMessage::Answer {
                    session_id: session_id.to_string(),
                    sdp: answer,
                });
            }
            Err(err) => {
                warn!(target: "agent::core", session_id, error = %err, "transport rejected offer");
            }
        }
    }

    async fn on_answer(&self, session_id: &str, _sdp: &str) {
        // The robot answers; it never receives one.
        debug!(target: "agent::core", session_id, "ignoring answer frame");
    }

    async fn on_ice(&self, session_id: &str, candidate: &IceCandidate) {
        if let Err(err) = self.transport.add_remote_candidate(candidate).await {
            debug!(target: "agent::core", session_id, error = %err, "dropped ice candidate");
        }
    }

    async fn on_bye(&self, session_id: &str) {
        info!(target: "agent::core", session_id, "operator hangup");
        self.pending.lock().take();
        self.watchdog.disarm();
        self.transport.close().await;
        self.session.terminate();
    }

    /// Out-of-band revocation. Ordering is load-bearing: the media transport
    /// is torn down before the session flips so no control frame can be
    /// admitted against a session that is about to die, and the safe stop
    /// runs last so its latched cause is `Revoked` even if teardown raced
    /// another trigger.
    async fn on_revoked(&self, session_id: &str, reason: &str) {
        warn!(target: "agent::core", session_id, reason, "session revoked by gateway");
        self.pending.lock().take();
        self.watchdog.disarm();
        self.transport.close().await;
        self.session.terminate();
        let _ = self.safety.trigger(SafetyTrigger::Revoked).await;
    }
}
