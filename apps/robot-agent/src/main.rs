use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainkvm_auth::{KeyResolver, TokenCache, TokenValidator};
use chainkvm_proto::IceCandidate;
use robot_agent::agent::{RobotAgent, TeleopTransport};
use robot_agent::config::AgentConfig;
use robot_agent::control::{spawn_expiry_watchdog, ControlLossWatchdog};
use robot_agent::safety::{RobotStopper, SafetyError, SafetyMonitor};
use robot_agent::session::SessionManager;
use robot_agent::signaling::{SignalingClient, SignalingConfig};

/// Stop handler for builds without a hardware integration. Logs the halt and
/// reports success so the safety machinery is exercised end to end.
struct LoggingStopper;

#[async_trait]
impl RobotStopper for LoggingStopper {
    async fn halt(&self) -> Result<(), SafetyError> {
        warn!(target: "agent::hardware", "HALT issued (no hardware backend wired)");
        Ok(())
    }
}

/// Placeholder transport until the WebRTC backend is linked in. Offers are
/// refused so an operator sees a clean error instead of a dead data channel.
struct UnwiredTransport;

#[async_trait]
impl TeleopTransport for UnwiredTransport {
    async fn answer_offer(&self, _session_id: &str, _sdp: &str) -> anyhow::Result<String> {
        anyhow::bail!("no media transport configured")
    }

    async fn add_remote_candidate(&self, _candidate: &IceCandidate) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::parse();
    info!(
        target: "agent::core",
        robot_id = %config.robot_id,
        signaling = %config.signaling_url,
        "starting robot agent"
    );

    let resolver = Arc::new(KeyResolver::new(config.jwks_url.clone()));
    resolver
        .refresh()
        .await
        .context("initial signing key fetch failed")?;

    let validator = Arc::new(TokenValidator::new(
        resolver,
        config.robot_id.clone(),
        Duration::from_secs(config.clock_skew_secs),
    ));
    let cache = Arc::new(TokenCache::new(config.token_cache_ttl()));
    let session = Arc::new(SessionManager::new(Some(validator), cache));

    let (safety, mut notifications) = SafetyMonitor::new(Some(Arc::new(LoggingStopper)), None);
    let safety = Arc::new(safety);
    let watchdog = ControlLossWatchdog::new(config.control_loss_window());

    let agent = Arc::new(RobotAgent::new(
        config.robot_id.clone(),
        session.clone(),
        safety.clone(),
        Arc::new(UnwiredTransport),
        watchdog.clone(),
        config.invalid_cmd_threshold,
        config.max_cmds_per_sec,
    ));

    let _loss_task = watchdog.spawn(session.clone(), safety.clone());
    let _expiry_task = spawn_expiry_watchdog(session.clone(), safety.clone(), config.expiry_poll());

    tokio::spawn(async move {
        while let Some(frame) = notifications.recv().await {
            info!(target: "agent::safety", ?frame, "state notification");
        }
    });

    let mut signaling = SignalingConfig::new(config.signaling_url.clone(), config.robot_id.clone());
    signaling.initial_backoff = config.reconnect_initial();
    signaling.max_backoff = config.reconnect_max();
    let client = Arc::new(SignalingClient::connect(signaling, agent.clone()));
    agent.attach_signaling(client.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(target: "agent::core", "shutdown requested");
    client.close();
    client.done().await;
    Ok(())
}
