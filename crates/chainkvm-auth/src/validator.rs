//! Capability token verification.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;

use crate::error::TokenError;
use crate::keys::KeyResolver;

/// Validated claims of a capability token. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Session the token is bound to (`sid`).
    pub session_id: String,
    /// Operator DID (`sub`).
    pub subject: String,
    /// Granted scope strings. Missing or malformed `scope` degrades to an
    /// empty list rather than a validation error.
    pub scopes: Vec<String>,
    pub nonce: Option<String>,
    /// Expiry, seconds since the Unix epoch (`exp`).
    pub expires_at: u64,
    /// Token identifier (`jti`), when the gateway issued one.
    pub token_id: Option<String>,
}

impl TokenClaims {
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    scope: Option<serde_json::Value>,
    #[serde(default)]
    nonce: Option<String>,
    exp: u64,
    #[serde(default)]
    jti: Option<String>,
}

/// Verifies capability tokens against the gateway's published keys.
///
/// EdDSA is a mandatory allow-list: a token signed with any other algorithm
/// (including `none`) is rejected before key resolution. The validator is a
/// pure function of its inputs plus the resolved key; it carries no session
/// state.
pub struct TokenValidator {
    resolver: Arc<KeyResolver>,
    robot_id: String,
    leeway: Duration,
}

impl TokenValidator {
    pub fn new(resolver: Arc<KeyResolver>, robot_id: impl Into<String>, leeway: Duration) -> Self {
        Self {
            resolver,
            robot_id: robot_id.into(),
            leeway,
        }
    }

    /// The robot identifier tokens must name in `aud`.
    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    /// Validate `token` for `expected_session_id` and extract its claims.
    ///
    /// Check order after signature verification: audience, then session
    /// binding. A token whose `sid` claim is absent fails with
    /// [`TokenError::SessionMismatch`], the same as a wrong `sid`.
    pub async fn validate(
        &self,
        token: &str,
        expected_session_id: &str,
    ) -> Result<TokenClaims, TokenError> {
        let header = decode_header(token).map_err(map_jwt_error)?;
        if header.alg != Algorithm::EdDSA {
            return Err(TokenError::InvalidSignature);
        }
        let kid = header.kid.ok_or(TokenError::Malformed)?;
        let key = self.resolver.get_public_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        validation.set_audience(&[self.robot_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);

        let data = decode::<RawClaims>(token, &key, &validation).map_err(map_jwt_error)?;
        let raw = data.claims;

        let session_id = match raw.sid {
            Some(sid) if sid == expected_session_id => sid,
            _ => return Err(TokenError::SessionMismatch),
        };

        Ok(TokenClaims {
            session_id,
            subject: raw.sub,
            scopes: extract_scopes(raw.scope.as_ref()),
            nonce: raw.nonce,
            expires_at: raw.exp,
            token_id: raw.jti,
        })
    }
}

fn extract_scopes(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::InvalidAudience => TokenError::InvalidAudience,
        ErrorKind::MissingRequiredClaim(claim) if claim.as_str() == "aud" => {
            TokenError::InvalidAudience
        }
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            TokenError::InvalidSignature
        }
        _ => TokenError::Malformed,
    }
}

/// Cache identity for a token: its `jti` claim when present, otherwise the
/// raw token string.
///
/// The payload is read without verification; an unverifiable identity can at
/// worst miss the cache, in which case the caller falls back to full
/// validation.
pub fn token_identity(token: &str) -> String {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) => payload,
        _ => return token.to_string(),
    };
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload) else {
        return token.to_string();
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return token.to_string();
    };
    match value.get("jti").and_then(|jti| jti.as_str()) {
        Some(jti) => jti.to_string(),
        None => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_extraction_degrades_to_empty() {
        assert!(extract_scopes(None).is_empty());
        assert!(extract_scopes(Some(&serde_json::json!("teleop:view"))).is_empty());
        assert!(extract_scopes(Some(&serde_json::json!({"not": "a list"}))).is_empty());
        assert_eq!(
            extract_scopes(Some(&serde_json::json!(["teleop:view", 42, "teleop:control"]))),
            vec!["teleop:view".to_string(), "teleop:control".to_string()],
        );
    }

    #[test]
    fn identity_prefers_jti() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"jti":"tok-1","sid":"s-1"}"#);
        let token = format!("hdr.{payload}.sig");
        assert_eq!(token_identity(&token), "tok-1");
    }

    #[test]
    fn identity_falls_back_to_token_string() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sid":"s-1"}"#);
        let token = format!("hdr.{payload}.sig");
        assert_eq!(token_identity(&token), token);
        assert_eq!(token_identity("garbage"), "garbage");
    }
}
