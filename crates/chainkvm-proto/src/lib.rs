//! Wire types shared by the robot agent and the ChainKVM gateway.
//!
//! Two surfaces live here: the JSON signaling protocol carried over the
//! gateway WebSocket, and the control-plane messages carried over the WebRTC
//! data channel. Both are plain serde types; transport and dispatch live with
//! their owners.

use serde::{Deserialize, Serialize};

/// Role a peer declares when joining a signaling session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Robot,
    Operator,
}

/// A single ICE candidate relayed through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Error codes the agent can return on the signaling channel.
///
/// The console distinguishes these from a plain transport drop, so the
/// operator can tell "you were kicked" apart from "the network died".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalErrorCode {
    MissingToken,
    InvalidToken,
    SessionMismatch,
    TokenInvalid,
}

/// Messages exchanged over the gateway signaling WebSocket.
///
/// The robot side only ever answers offers; it never initiates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Sent once after connecting, identifying this peer to the gateway.
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        robot_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        role: PeerRole,
    },
    /// SDP offer from the operator, carrying the capability token for the
    /// session being established.
    Offer {
        session_id: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// SDP answer from the robot.
    Answer { session_id: String, sdp: String },
    /// Trickled ICE candidate.
    Ice {
        session_id: String,
        candidate: IceCandidate,
    },
    /// Normal hangup.
    Bye { session_id: String },
    /// Typed error frame.
    Error {
        code: SignalErrorCode,
        message: String,
    },
    /// Out-of-band revocation pushed by the gateway. Carries a
    /// human-readable reason for the operator console.
    Revoked { session_id: String, reason: String },
}

/// Control-plane commands received over the WebRTC data channel.
///
/// Only the shape the agent needs for authorization is modeled here; command
/// dispatch to actuators is the hardware layer's business.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Drive {
        linear: f64,
        angular: f64,
        #[serde(default)]
        seq: u64,
    },
    EStop {
        #[serde(default)]
        seq: u64,
    },
    Ping {
        #[serde(default)]
        seq: u64,
    },
}

impl ControlCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlCommand::Drive { .. } => "drive",
            ControlCommand::EStop { .. } => "e_stop",
            ControlCommand::Ping { .. } => "ping",
        }
    }
}

/// State notification frame emitted after a safe-stop episode.
///
/// `safe_stop_failed` means the hardware halt was attempted and reported
/// failure; downstream consumers must assume the robot may still be moving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateNotification {
    SafeStop {
        trigger: String,
        duration_ms: u64,
    },
    SafeStopFailed {
        trigger: String,
        duration_ms: u64,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_frame_shape() {
        let frame: SignalMessage = serde_json::from_str(
            r#"{"type":"offer","session_id":"s-1","sdp":"v=0...","token":"abc.def.ghi"}"#,
        )
        .unwrap();
        match frame {
            SignalMessage::Offer {
                session_id,
                sdp,
                token,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(sdp, "v=0...");
                assert_eq!(token.as_deref(), Some("abc.def.ghi"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn offer_token_is_optional() {
        let frame: SignalMessage =
            serde_json::from_str(r#"{"type":"offer","session_id":"s-1","sdp":"v=0"}"#).unwrap();
        assert!(matches!(frame, SignalMessage::Offer { token: None, .. }));
    }

    #[test]
    fn revoked_frame_round_trips() {
        let frame = SignalMessage::Revoked {
            session_id: "s-2".into(),
            reason: "Policy violation".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "revoked");
        assert_eq!(json["reason"], "Policy violation");
    }

    #[test]
    fn join_omits_absent_ids() {
        let frame = SignalMessage::Join {
            robot_id: Some("robot-7".into()),
            session_id: None,
            role: PeerRole::Robot,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["robot_id"], "robot-7");
        assert_eq!(json["role"], "robot");
        assert!(json.get("session_id").is_none());
    }

    #[test]
    fn control_command_tags() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type":"e_stop","seq":9}"#).unwrap();
        assert_eq!(cmd, ControlCommand::EStop { seq: 9 });
        assert_eq!(cmd.kind(), "e_stop");

        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type":"drive","linear":0.5,"angular":-0.1}"#).unwrap();
        assert_eq!(cmd.kind(), "drive");
    }

    #[test]
    fn safe_stop_failed_carries_error() {
        let frame = StateNotification::SafeStopFailed {
            trigger: "e_stop".into(),
            duration_ms: 12,
            error: "relay jammed".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "safe_stop_failed");
        assert_eq!(json["error"], "relay jammed");
    }
}
