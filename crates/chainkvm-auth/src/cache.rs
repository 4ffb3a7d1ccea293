//! Memoization of successful token validations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::unix_now;
use crate::validator::TokenClaims;

struct CachedToken {
    session_id: String,
    claims: TokenClaims,
    cached_at: Instant,
}

/// Caches validated claims keyed by token identity, to amortize signature
/// verification across the command stream.
///
/// Every read re-checks three things: the requesting session matches the one
/// the entry was cached for, the entry is younger than the cache TTL, and
/// the claims' own expiry has not passed. There is no active eviction; a
/// stale entry simply stops being returned.
///
/// Session termination calls [`TokenCache::invalidate_session`], which is
/// the mechanism that guarantees a cached validation cannot be replayed
/// after its session is gone.
pub struct TokenCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, identity: &str, session_id: &str) -> Option<TokenClaims> {
        let entries = self.entries.read();
        let entry = entries.get(identity)?;
        if entry.session_id != session_id {
            return None;
        }
        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }
        if entry.claims.is_expired_at(unix_now()) {
            return None;
        }
        Some(entry.claims.clone())
    }

    pub fn set(&self, identity: &str, session_id: &str, claims: TokenClaims) {
        self.entries.write().insert(
            identity.to_string(),
            CachedToken {
                session_id: session_id.to_string(),
                claims,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, identity: &str) {
        self.entries.write().remove(identity);
    }

    /// Drop every entry bound to `session_id`.
    pub fn invalidate_session(&self, session_id: &str) {
        self.entries
            .write()
            .retain(|_, entry| entry.session_id != session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
