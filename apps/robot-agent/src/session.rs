//! Session lifecycle and scope authorization.

use std::sync::Arc;

use chainkvm_auth::{token_identity, ScopeSet, TokenCache, TokenClaims, TokenError, TokenValidator};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Lifecycle of one teleoperation session.
///
/// `Terminated` is terminal for the session instance; the manager must be
/// `reset()` before it can host another connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Terminated,
}

/// Everything the agent knows about the active session. Created by a
/// successful validation, owned exclusively by the [`SessionManager`],
/// destroyed on terminate or reset.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub operator: String,
    pub robot_id: String,
    pub scopes: ScopeSet,
    /// Seconds since the Unix epoch.
    pub expires_at: u64,
}

impl SessionInfo {
    pub fn from_claims(claims: &TokenClaims, robot_id: &str) -> Self {
        Self {
            session_id: claims.session_id.clone(),
            operator: claims.subject.clone(),
            robot_id: robot_id.to_string(),
            scopes: ScopeSet::from_scopes(claims.scopes.iter().cloned()),
            expires_at: claims.expires_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no token validator configured")]
    NoValidator,
    #[error("session already active")]
    AlreadyActive,
    #[error("session terminated")]
    Terminated,
    #[error("no active session")]
    NoActiveSession,
    #[error(transparent)]
    Token(#[from] TokenError),
}

type StateCallback = Arc<dyn Fn(SessionState) + Send + Sync>;

struct Inner {
    state: SessionState,
    info: Option<SessionInfo>,
    /// Session id of the most recent successful validation, so a terminate
    /// from `Pending` still purges what was cached for it.
    validated_session: Option<String>,
    on_state_change: Option<StateCallback>,
}

/// Owns the Pending → Active → Terminated lifecycle and composes the token
/// validator with the token cache.
///
/// All multi-step mutation happens under one mutex acquisition, and the
/// state-change callback is dispatched on a spawned task after the lock is
/// released, so a slow or reentrant observer can never stall `terminate()`
/// or `activate()`.
pub struct SessionManager {
    validator: Option<Arc<TokenValidator>>,
    cache: Arc<TokenCache>,
    inner: Mutex<Inner>,
    /// Serializes this manager's own validations; the expensive signature
    /// check never runs under `inner`.
    validate_gate: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(validator: Option<Arc<TokenValidator>>, cache: Arc<TokenCache>) -> Self {
        Self {
            validator,
            cache,
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                info: None,
                validated_session: None,
                on_state_change: None,
            }),
            validate_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_on_state_change(&self, callback: impl Fn(SessionState) + Send + Sync + 'static) {
        self.inner.lock().on_state_change = Some(Arc::new(callback));
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.inner.lock().info.clone()
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    /// Validate `token` for `session_id`, consulting the cache first.
    ///
    /// Has no effect on lifecycle state: a successful validation does not
    /// activate the session. A terminated manager refuses to validate
    /// anything, cached or not.
    pub async fn validate_token(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<SessionInfo, SessionError> {
        if self.inner.lock().state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        let validator = self.validator.as_ref().ok_or(SessionError::NoValidator)?;

        let _serial = self.validate_gate.lock().await;

        let identity = token_identity(token);
        if let Some(claims) = self.cache.get(&identity, session_id) {
            debug!(target: "agent::session", session_id, "token validated from cache");
            return Ok(SessionInfo::from_claims(&claims, validator.robot_id()));
        }

        let claims = validator.validate(token, session_id).await?;

        // A terminate may have landed while the signature was being checked;
        // caching the result now would resurrect a purged session.
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return Err(SessionError::Terminated);
            }
            self.cache.set(&identity, session_id, claims.clone());
            inner.validated_session = Some(session_id.to_string());
        }
        debug!(target: "agent::session", session_id, operator = %claims.subject, "token validated");
        Ok(SessionInfo::from_claims(&claims, validator.robot_id()))
    }

    /// Transition Pending → Active. Rejected from any other state.
    pub fn activate(&self, info: SessionInfo) -> Result<(), SessionError> {
        let callback;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Active => return Err(SessionError::AlreadyActive),
                SessionState::Terminated => return Err(SessionError::Terminated),
                SessionState::Pending => {}
            }
            info!(
                target: "agent::session",
                session_id = %info.session_id,
                operator = %info.operator,
                "session active"
            );
            inner.state = SessionState::Active;
            inner.info = Some(info);
            callback = inner.on_state_change.clone();
        }
        notify(callback, SessionState::Active);
        Ok(())
    }

    /// Idempotent termination. The first call purges the cache for the
    /// current session, clears the session info, and fires the state-change
    /// callback exactly once; repeat calls are no-ops.
    pub fn terminate(&self) {
        let callback;
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return;
            }
            if let Some(info) = inner.info.take() {
                self.cache.invalidate_session(&info.session_id);
            }
            if let Some(session_id) = inner.validated_session.take() {
                self.cache.invalidate_session(&session_id);
            }
            info!(target: "agent::session", "session terminated");
            inner.state = SessionState::Terminated;
            callback = inner.on_state_change.clone();
        }
        notify(callback, SessionState::Terminated);
    }

    /// Return the manager to `Pending` for a fresh connection attempt.
    /// Cache entries for other sessions are left alone.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Pending;
        inner.info = None;
        inner.validated_session = None;
    }

    /// False whenever there is no active session.
    pub fn has_scope(&self, scope: &str) -> bool {
        let inner = self.inner.lock();
        inner.state == SessionState::Active
            && inner
                .info
                .as_ref()
                .map(|info| info.scopes.has(scope))
                .unwrap_or(false)
    }
}

/// Fire-and-forget dispatch off the critical path; the callback may re-enter
/// the manager without deadlocking.
fn notify(callback: Option<StateCallback>, state: SessionState) {
    if let Some(callback) = callback {
        tokio::spawn(async move { callback(state) });
    }
}
