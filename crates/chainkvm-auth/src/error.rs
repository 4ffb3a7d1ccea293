use thiserror::Error;

/// Failures resolving a signing key from the gateway's published key set.
#[derive(Debug, Clone, Error)]
pub enum KeyError {
    #[error("signing key {0} not found")]
    KeyNotFound(String),
    #[error("jwks fetch failed: {0}")]
    FetchFailed(String),
    #[error("invalid jwks payload: {0}")]
    InvalidJwks(String),
}

/// Failures validating a capability token.
///
/// Audience and session mismatches are deliberately distinct variants; the
/// gateway audit trail treats "token for another robot" and "token for
/// another session" as different events.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token audience mismatch")]
    InvalidAudience,
    #[error("token session mismatch")]
    SessionMismatch,
    #[error(transparent)]
    Key(#[from] KeyError),
}
