//! Runtime configuration for the robot agent.

use std::time::Duration;

use clap::Parser;

/// All knobs the agent accepts, flag-first with environment fallbacks so the
/// same binary works from systemd units and from a shell.
#[derive(Debug, Clone, Parser)]
#[command(name = "robot-agent", about = "ChainKVM robot edge agent")]
pub struct AgentConfig {
    /// Stable identifier this robot announces to the gateway.
    #[arg(long, env = "CHAINKVM_ROBOT_ID")]
    pub robot_id: String,

    /// Gateway signaling WebSocket URL.
    #[arg(long, env = "CHAINKVM_SIGNALING_URL")]
    pub signaling_url: String,

    /// JWKS endpoint publishing the gateway's token signing keys.
    #[arg(long, env = "CHAINKVM_JWKS_URL")]
    pub jwks_url: String,

    /// Clock skew tolerated when checking token validity windows, in seconds.
    #[arg(long, env = "CHAINKVM_CLOCK_SKEW_SECS", default_value_t = 30)]
    pub clock_skew_secs: u64,

    /// How long a validated token stays in the local cache, in seconds.
    #[arg(long, env = "CHAINKVM_TOKEN_CACHE_TTL_SECS", default_value_t = 60)]
    pub token_cache_ttl_secs: u64,

    /// Control silence window before the loss-of-control safe stop, in ms.
    #[arg(long, env = "CHAINKVM_CONTROL_LOSS_MS", default_value_t = 2000)]
    pub control_loss_ms: u64,

    /// Invalid or unauthorized commands tolerated before a safe stop.
    #[arg(long, env = "CHAINKVM_INVALID_CMD_THRESHOLD", default_value_t = 5)]
    pub invalid_cmd_threshold: u32,

    /// Command rate limit applied to everything except e-stop.
    #[arg(long, env = "CHAINKVM_MAX_CMDS_PER_SEC", default_value_t = 50)]
    pub max_cmds_per_sec: u32,

    /// Token expiry poll interval, in ms.
    #[arg(long, env = "CHAINKVM_EXPIRY_POLL_MS", default_value_t = 1000)]
    pub expiry_poll_ms: u64,

    /// First reconnect delay after a signaling drop, in ms.
    #[arg(long, env = "CHAINKVM_RECONNECT_INITIAL_MS", default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    /// Reconnect delay ceiling, in ms.
    #[arg(long, env = "CHAINKVM_RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,
}

impl AgentConfig {
    pub fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_ttl_secs)
    }

    pub fn control_loss_window(&self) -> Duration {
        Duration::from_millis(self.control_loss_ms)
    }

    pub fn expiry_poll(&self) -> Duration {
        Duration::from_millis(self.expiry_poll_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_only_required_args() {
        let config = AgentConfig::try_parse_from([
            "robot-agent",
            "--robot-id",
            "robot-7",
            "--signaling-url",
            "wss://gw.example/signal",
            "--jwks-url",
            "https://gw.example/.well-known/jwks.json",
        ])
        .unwrap();
        assert_eq!(config.clock_skew_secs, 30);
        assert_eq!(config.control_loss_window(), Duration::from_secs(2));
        assert_eq!(config.max_cmds_per_sec, 50);
        assert_eq!(config.reconnect_max(), Duration::from_secs(30));
    }

    #[test]
    fn missing_robot_id_is_an_error() {
        let err = AgentConfig::try_parse_from([
            "robot-agent",
            "--signaling-url",
            "wss://gw.example/signal",
            "--jwks-url",
            "https://gw.example/jwks",
        ]);
        assert!(err.is_err());
    }
}
