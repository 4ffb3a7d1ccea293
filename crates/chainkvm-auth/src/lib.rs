//! Capability-token trust core for the ChainKVM robot agent.
//!
//! Every control-plane action a remote operator takes is gated on a signed,
//! short-lived capability token. This crate owns the pieces of that trust
//! boundary that are pure of robot state: resolving the gateway's signing
//! keys, verifying tokens against them, and memoizing successful
//! verifications so the hot path stays well under the per-command budget.
//!
//! The cache is strictly a latency optimization: every read re-checks the
//! session binding and both expiries, so disabling it changes cost, never
//! correctness.

pub mod cache;
pub mod error;
pub mod keys;
pub mod scope;
pub mod validator;

pub use cache::TokenCache;
pub use error::{KeyError, TokenError};
pub use keys::KeyResolver;
pub use scope::ScopeSet;
pub use validator::{token_identity, TokenClaims, TokenValidator};

/// Seconds since the Unix epoch, saturating to zero on a misconfigured clock.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
