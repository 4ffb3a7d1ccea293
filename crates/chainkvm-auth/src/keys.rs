//! JWKS-style resolution of the gateway's token-signing keys.

use std::collections::HashMap;

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::KeyError;

/// Fetches and caches the gateway's public key set, indexed by key id.
///
/// Refresh is purely reactive: a cache miss performs exactly one fetch and
/// replaces the whole in-memory set atomically. There is no background
/// polling, which keeps behavior deterministic under test.
///
/// Only Ed25519 keys (`kty: "OKP"`, `crv: "Ed25519"`) are retained; entries
/// of any other type are silently skipped so the gateway can rotate to new
/// key material without breaking older agents.
pub struct KeyResolver {
    jwks_url: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl KeyResolver {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the public key for `kid`, refreshing the key set once on miss.
    pub async fn get_public_key(&self, kid: &str) -> Result<DecodingKey, KeyError> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys.get(kid) {
                return Ok(key.clone());
            }
        }

        // Re-check under the write lock; a concurrent miss may already have
        // refreshed the set while we waited.
        let mut keys = self.keys.write().await;
        if let Some(key) = keys.get(kid) {
            return Ok(key.clone());
        }
        *keys = self.fetch_jwks().await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| KeyError::KeyNotFound(kid.to_string()))
    }

    /// Force a refresh, replacing the entire key set.
    pub async fn refresh(&self) -> Result<(), KeyError> {
        let fresh = self.fetch_jwks().await?;
        *self.keys.write().await = fresh;
        Ok(())
    }

    async fn fetch_jwks(&self) -> Result<HashMap<String, DecodingKey>, KeyError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|err| KeyError::FetchFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(KeyError::FetchFailed(format!(
                "status {}",
                response.status()
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| KeyError::InvalidJwks(err.to_string()))?;

        let mut keys = HashMap::new();
        for entry in body.keys {
            if entry.kty != "OKP" || entry.crv.as_deref() != Some("Ed25519") {
                debug!(
                    target: "auth::keys",
                    kty = %entry.kty,
                    "skipping jwks entry with unsupported key type"
                );
                continue;
            }
            let (Some(kid), Some(x)) = (entry.kid, entry.x) else {
                continue;
            };
            match DecodingKey::from_ed_components(&x) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    debug!(
                        target: "auth::keys",
                        kid = %kid,
                        error = %err,
                        "skipping jwks entry with unparseable key material"
                    );
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
}
