//! Teleoperation scopes granted by capability tokens.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Read-only access to the video stream and state notifications.
pub const VIEW: &str = "teleop:view";
/// Drive and actuator commands.
pub const CONTROL: &str = "teleop:control";
/// Emergency stop. Bypasses the command rate limiter.
pub const ESTOP: &str = "teleop:estop";

/// The set of scopes granted to one session.
///
/// Built once from validated token claims and never widened afterwards;
/// a session that needs more scope needs a new token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet {
    inner: HashSet<String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, scope: &str) -> bool {
        self.inner.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.inner.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let scopes = ScopeSet::from_scopes([VIEW, CONTROL]);
        assert!(scopes.has(VIEW));
        assert!(scopes.has(CONTROL));
        assert!(!scopes.has(ESTOP));
        assert!(!scopes.has("teleop:configure"));
    }

    #[test]
    fn empty_set_grants_nothing() {
        let scopes = ScopeSet::new();
        assert!(scopes.is_empty());
        assert!(!scopes.has(VIEW));
    }
}
