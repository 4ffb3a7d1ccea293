//! Full agent flow: validated offer, active session, admitted control
//! traffic, then out-of-band revocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::json;

use chainkvm_auth::{scope, unix_now, KeyResolver, TokenCache, TokenValidator};
use chainkvm_proto::IceCandidate;
use robot_agent::agent::{RobotAgent, TeleopTransport};
use robot_agent::control::ControlLossWatchdog;
use robot_agent::safety::{RobotStopper, SafetyError, SafetyMonitor, SafetyTrigger};
use robot_agent::session::{SessionError, SessionManager, SessionState};
use robot_agent::signaling::SignalHandler;

const ROBOT_ID: &str = "did:key:robot-7";
const SESSION_ID: &str = "session-1";

struct TestKey {
    encoding: EncodingKey,
    x: String,
}

fn test_key() -> TestKey {
    let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
    let pair = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
    TestKey {
        encoding: EncodingKey::from_ed_der(doc.as_ref()),
        x: URL_SAFE_NO_PAD.encode(pair.public_key().as_ref()),
    }
}

fn sign_token(key: &TestKey, session_id: &str, exp: u64) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some("gw-1".to_string());
    let claims = json!({
        "sub": "did:key:operator-1",
        "aud": ROBOT_ID,
        "sid": session_id,
        "scope": [scope::VIEW, scope::CONTROL],
        "exp": exp,
        "jti": "tok-1"
    });
    jsonwebtoken::encode(&header, &claims, &key.encoding).unwrap()
}

async fn serve_jwks(key: &TestKey) -> String {
    let body = json!({
        "keys": [
            { "kid": "gw-1", "kty": "OKP", "crv": "Ed25519", "x": key.x }
        ]
    })
    .to_string();
    let app = Router::new().route(
        "/jwks.json",
        get(move || {
            let body = body.clone();
            async move { ([(header::CONTENT_TYPE, "application/json")], body) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/jwks.json")
}

struct MockTransport {
    closes: AtomicUsize,
}

#[async_trait]
impl TeleopTransport for MockTransport {
    async fn answer_offer(&self, _session_id: &str, _sdp: &str) -> anyhow::Result<String> {
        Ok("v=0 answer".to_string())
    }

    async fn add_remote_candidate(&self, _candidate: &IceCandidate) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingStopper(AtomicUsize);

#[async_trait]
impl RobotStopper for CountingStopper {
    async fn halt(&self) -> Result<(), SafetyError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    agent: Arc<RobotAgent>,
    session: Arc<SessionManager>,
    cache: Arc<TokenCache>,
    transport: Arc<MockTransport>,
    stopper: Arc<CountingStopper>,
}

async fn build_harness(jwks_url: &str) -> Harness {
    let resolver = Arc::new(KeyResolver::new(jwks_url));
    let validator = Arc::new(TokenValidator::new(
        resolver,
        ROBOT_ID,
        Duration::from_secs(30),
    ));
    let cache = Arc::new(TokenCache::new(Duration::from_secs(60)));
    let session = Arc::new(SessionManager::new(Some(validator), cache.clone()));

    let stopper = Arc::new(CountingStopper(AtomicUsize::new(0)));
    let (safety, _notifications) = SafetyMonitor::new(Some(stopper.clone()), None);
    let transport = Arc::new(MockTransport {
        closes: AtomicUsize::new(0),
    });
    let watchdog = ControlLossWatchdog::new(Duration::from_secs(5));

    let agent = Arc::new(RobotAgent::new(
        ROBOT_ID,
        session.clone(),
        Arc::new(safety),
        transport.clone(),
        watchdog,
        5,
        50,
    ));
    Harness {
        agent,
        session,
        cache,
        transport,
        stopper,
    }
}

#[tokio::test]
async fn offer_to_active_session_to_admitted_drive() {
    let key = test_key();
    let jwks_url = serve_jwks(&key).await;
    let harness = build_harness(&jwks_url).await;
    let token = sign_token(&key, SESSION_ID, unix_now() + 300);

    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer", Some(&token))
        .await;
    // Validation succeeded and an answer went out, but the session is not
    // active until the peer connection is up.
    assert_eq!(harness.session.state(), SessionState::Pending);
    assert!(!harness.cache.is_empty());

    harness.agent.on_transport_connected().await;
    assert_eq!(harness.session.state(), SessionState::Active);

    let cmd = harness
        .agent
        .handle_control_frame(r#"{"type":"drive","linear":0.5,"angular":0.0,"seq":1}"#)
        .await
        .unwrap();
    assert_eq!(cmd.kind(), "drive");
    assert_eq!(harness.stopper.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn offer_with_wrong_session_binding_never_reaches_transport() {
    let key = test_key();
    let jwks_url = serve_jwks(&key).await;
    let harness = build_harness(&jwks_url).await;
    let token = sign_token(&key, "some-other-session", unix_now() + 300);

    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer", Some(&token))
        .await;

    assert_eq!(harness.session.state(), SessionState::Pending);
    assert!(harness.cache.is_empty());
    harness.agent.on_transport_connected().await;
    // Nothing pending, so the connection callback is a no-op.
    assert_eq!(harness.session.state(), SessionState::Pending);
}

#[tokio::test]
async fn revocation_stops_tears_down_and_blocks_revalidation() {
    let key = test_key();
    let jwks_url = serve_jwks(&key).await;
    let harness = build_harness(&jwks_url).await;
    let token = sign_token(&key, SESSION_ID, unix_now() + 300);

    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer", Some(&token))
        .await;
    harness.agent.on_transport_connected().await;
    assert_eq!(harness.session.state(), SessionState::Active);

    harness.agent.on_revoked(SESSION_ID, "Policy violation").await;

    assert_eq!(harness.transport.closes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert!(harness.cache.is_empty());
    assert_eq!(harness.stopper.0.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.agent.safety().last_result().await.unwrap().trigger,
        SafetyTrigger::Revoked
    );

    // The same still-valid token is refused after revocation.
    let err = harness
        .session
        .validate_token(SESSION_ID, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Terminated), "{err:?}");
}

#[tokio::test]
async fn hangup_then_fresh_offer_hosts_a_second_session() {
    let key = test_key();
    let jwks_url = serve_jwks(&key).await;
    let harness = build_harness(&jwks_url).await;

    let token = sign_token(&key, SESSION_ID, unix_now() + 300);
    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer", Some(&token))
        .await;
    harness.agent.on_transport_connected().await;
    assert_eq!(harness.session.state(), SessionState::Active);

    harness.agent.on_bye(SESSION_ID).await;
    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert_eq!(harness.transport.closes.load(Ordering::SeqCst), 1);

    // The operator comes back with a new session; a plain hangup must not
    // require a process restart.
    let token = sign_token(&key, "session-2", unix_now() + 300);
    harness
        .agent
        .on_offer("session-2", "v=0 offer", Some(&token))
        .await;
    harness.agent.on_transport_connected().await;

    assert_eq!(harness.session.state(), SessionState::Active);
    assert_eq!(harness.session.info().unwrap().session_id, "session-2");
    assert_eq!(harness.stopper.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_offer_hits_the_token_cache() {
    let key = test_key();
    let jwks_url = serve_jwks(&key).await;
    let harness = build_harness(&jwks_url).await;
    let token = sign_token(&key, SESSION_ID, unix_now() + 300);

    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer", Some(&token))
        .await;
    assert_eq!(harness.cache.len(), 1);

    // Re-offer with the same token, e.g. after an ICE restart. Still one
    // cache entry, no duplicate.
    harness
        .agent
        .on_offer(SESSION_ID, "v=0 offer again", Some(&token))
        .await;
    assert_eq!(harness.cache.len(), 1);
}
