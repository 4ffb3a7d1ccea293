//! Reconnecting WebSocket client for the gateway signaling channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainkvm_proto::{IceCandidate, PeerRole, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel not connected")]
    NotConnected,
    #[error("signaling connection closed")]
    ConnectionClosed,
}

/// Receives every parsed signaling frame addressed to this robot.
///
/// Handlers run on the read loop; anything slow belongs on a task of the
/// handler's own making.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_offer(&self, session_id: &str, sdp: &str, token: Option<&str>);
    async fn on_answer(&self, session_id: &str, sdp: &str);
    async fn on_ice(&self, session_id: &str, candidate: &IceCandidate);
    async fn on_bye(&self, session_id: &str);
    async fn on_revoked(&self, session_id: &str, reason: &str);
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub robot_id: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SignalingConfig {
    pub fn new(url: impl Into<String>, robot_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            robot_id: robot_id.into(),
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

enum ConnectionExit {
    Lost,
    Shutdown,
}

/// Maintains the WebSocket to the gateway, reconnecting with exponential
/// backoff until [`SignalingClient::close`] is called.
///
/// On every (re)connect the client sends a `join` identifying the robot,
/// then dispatches inbound frames to the registered handler. Malformed
/// frames are logged and skipped; they never kill the loop.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl SignalingClient {
    pub fn connect(config: SignalingConfig, handler: Arc<dyn SignalHandler>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_loop(
            config,
            handler,
            outbound_rx,
            shutdown_rx,
            finished_tx,
            connected.clone(),
        ));

        Self {
            outbound: outbound_tx,
            connected,
            shutdown: shutdown_tx,
            finished: finished_rx,
        }
    }

    /// Queue a frame for the gateway. Fails fast while disconnected rather
    /// than buffering into a dead reconnect cycle.
    pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::ConnectionClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop reconnecting and close the socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolves once the connection loop has fully terminated.
    pub async fn done(&self) {
        let mut finished = self.finished.clone();
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn run_loop(
    config: SignalingConfig,
    handler: Arc<dyn SignalHandler>,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    finished_tx: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = config.initial_backoff;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match timeout(config.connect_timeout, connect_async(&config.url)).await {
            Ok(Ok((stream, _))) => {
                info!(target: "agent::signaling", url = %config.url, "signaling connected");
                backoff = config.initial_backoff;
                connected.store(true, Ordering::SeqCst);
                let exit = serve_connection(
                    stream,
                    &config,
                    &handler,
                    &mut outbound_rx,
                    &mut shutdown_rx,
                )
                .await;
                connected.store(false, Ordering::SeqCst);
                if matches!(exit, ConnectionExit::Shutdown) {
                    break;
                }
                warn!(target: "agent::signaling", "signaling connection lost; reconnecting");
            }
            Ok(Err(err)) => {
                warn!(target: "agent::signaling", error = %err, "signaling connect failed");
            }
            Err(_) => {
                warn!(
                    target: "agent::signaling",
                    timeout_ms = config.connect_timeout.as_millis() as u64,
                    "signaling connect timed out"
                );
            }
        }

        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
    let _ = finished_tx.send(true);
}

async fn serve_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &SignalingConfig,
    handler: &Arc<dyn SignalHandler>,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignalMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectionExit {
    let (mut sink, mut source) = stream.split();

    let join = SignalMessage::Join {
        robot_id: Some(config.robot_id.clone()),
        session_id: None,
        role: PeerRole::Robot,
    };
    let join_text = match serde_json::to_string(&join) {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "agent::signaling", error = %err, "failed to encode join");
            return ConnectionExit::Lost;
        }
    };
    if sink.send(Message::Text(join_text)).await.is_err() {
        return ConnectionExit::Lost;
    }

    loop {
        tokio::select! {
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch(&text, handler).await,
                Some(Ok(Message::Close(_))) | None => return ConnectionExit::Lost,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "agent::signaling", error = %err, "signaling read error");
                    return ConnectionExit::Lost;
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(target: "agent::signaling", error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        return ConnectionExit::Lost;
                    }
                }
                None => return ConnectionExit::Shutdown,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionExit::Shutdown;
                }
            }
        }
    }
}

async fn dispatch(text: &str, handler: &Arc<dyn SignalHandler>) {
    match serde_json::from_str::<SignalMessage>(text) {
        Ok(SignalMessage::Offer {
            session_id,
            sdp,
            token,
        }) => handler.on_offer(&session_id, &sdp, token.as_deref()).await,
        Ok(SignalMessage::Answer { session_id, sdp }) => {
            handler.on_answer(&session_id, &sdp).await
        }
        Ok(SignalMessage::Ice {
            session_id,
            candidate,
        }) => handler.on_ice(&session_id, &candidate).await,
        Ok(SignalMessage::Bye { session_id }) => handler.on_bye(&session_id).await,
        Ok(SignalMessage::Revoked { session_id, reason }) => {
            handler.on_revoked(&session_id, &reason).await
        }
        Ok(SignalMessage::Error { code, message }) => {
            warn!(target: "agent::signaling", ?code, %message, "gateway error frame");
        }
        Ok(SignalMessage::Join { .. }) => {
            debug!(target: "agent::signaling", "ignoring unexpected join frame");
        }
        Err(err) => {
            debug!(target: "agent::signaling", error = %err, "ignoring malformed signaling frame");
        }
    }
}
