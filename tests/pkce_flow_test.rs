// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the oidc-gatekeeper project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Integration tests for the Authorization-Code + PKCE flow: authorization
//! URL assembly, callback validation, the code exchange through an injected
//! transport, and a full exchange-then-verify round trip.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use oidc_gatekeeper::flow::pkce;
use oidc_gatekeeper::{
    AuthError, HttpTokenTransport, KeyResolver, OAuthFlow, PkceSession, ProviderConfig,
    RefreshErrorKind, StaticKeys, TokenTransport, TransportReply, VerificationPolicy, Verifier,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Setup logger for tests
fn setup() {
    INIT.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

const ISSUER: &str = "https://idp.example.com/realms/aerie";
const SECRET: &[u8] = b"integration-test-shared-secret";

fn test_config() -> ProviderConfig {
    ProviderConfig {
        issuer: ISSUER.to_string(),
        authorization_endpoint: Some(
            "https://idp.example.com/protocol/openid-connect/auth".to_string(),
        ),
        token_endpoint: Some("https://idp.example.com/protocol/openid-connect/token".to_string()),
        jwks_uri: None,
        discovery_url: None,
        redirect_uri: "https://app.example.com/auth/callback".to_string(),
        client_id: "aerie-ui".to_string(),
        client_secret: None,
        scopes: vec!["openid".into(), "profile".into(), "email".into()],
        http_timeout: Duration::from_secs(5),
    }
}

/// Canned-reply transport that records every posted form.
struct MockTransport {
    replies: Arc<Mutex<VecDeque<TransportReply>>>,
    forms: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TokenTransport for MockTransport {
    async fn post_form(
        &self,
        _endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<TransportReply, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.forms.lock().unwrap().push(
            form.iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        );
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected token endpoint call"))
    }
}

struct MockHandles {
    forms: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockHandles {
    fn form(&self, index: usize) -> HashMap<String, String> {
        self.forms.lock().unwrap()[index].iter().cloned().collect()
    }
}

fn mock_flow(config: ProviderConfig, replies: Vec<TransportReply>) -> (OAuthFlow, MockHandles) {
    let forms = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = MockTransport {
        replies: Arc::new(Mutex::new(replies.into_iter().collect())),
        forms: forms.clone(),
        calls: calls.clone(),
    };
    let flow = OAuthFlow::with_transport(config, Box::new(transport)).expect("flow construction");
    (flow, MockHandles { forms, calls })
}

fn token_reply(access_token: &str) -> TransportReply {
    TransportReply {
        status: 200,
        body: json!({
            "access_token": access_token,
            "id_token": "an-id-token",
            "refresh_token": "a-refresh-token",
            "expires_in": 300,
            "refresh_expires_in": 1800,
        })
        .to_string(),
    }
}

#[test]
fn authorization_url_carries_the_pkce_parameters() {
    setup();
    let (flow, _) = mock_flow(test_config(), Vec::new());
    let request = flow.begin_authorization();

    let query: HashMap<String, String> = request
        .authorization_url
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    assert_eq!(query["response_type"], "code");
    assert_eq!(query["client_id"], "aerie-ui");
    assert_eq!(query["redirect_uri"], "https://app.example.com/auth/callback");
    assert_eq!(query["scope"], "openid profile email");
    assert_eq!(query["state"], request.session.state);
    assert_eq!(query["code_challenge_method"], "S256");
    assert_eq!(
        query["code_challenge"],
        pkce::code_challenge_s256(&request.session.code_verifier)
    );
    // The verifier itself must never appear in the URL.
    assert_ne!(query["code_challenge"], request.session.code_verifier);
}

#[test]
fn callback_with_matching_state_returns_the_code() {
    setup();
    let (flow, _) = mock_flow(test_config(), Vec::new());
    let request = flow.begin_authorization();
    let code = flow
        .validate_callback(
            &request.session,
            Some(&request.session.state),
            Some("the-code"),
        )
        .expect("callback validation");
    assert_eq!(code, "the-code");
}

#[test]
fn callback_state_mismatch_aborts_the_flow() {
    setup();
    let (flow, _) = mock_flow(test_config(), Vec::new());
    let request = flow.begin_authorization();
    let err = flow
        .validate_callback(&request.session, Some("tampered-state"), Some("the-code"))
        .unwrap_err();
    match err {
        AuthError::Exchange { detail } => assert!(detail.contains("state")),
        other => panic!("expected Exchange, got {:?}", other),
    }
}

#[test]
fn callback_without_a_code_aborts_the_flow() {
    setup();
    let (flow, _) = mock_flow(test_config(), Vec::new());
    let request = flow.begin_authorization();
    let err = flow
        .validate_callback(&request.session, Some(&request.session.state), None)
        .unwrap_err();
    assert!(matches!(err, AuthError::Exchange { .. }));
}

#[test]
fn stale_authorization_session_is_rejected() {
    setup();
    let (flow, _) = mock_flow(test_config(), Vec::new());
    let session = PkceSession {
        code_verifier: pkce::generate_code_verifier(),
        state: pkce::generate_state(),
        created_at: Utc::now() - chrono::Duration::seconds(600),
    };
    let state = session.state.clone();
    let err = flow
        .validate_callback(&session, Some(&state), Some("the-code"))
        .unwrap_err();
    match err {
        AuthError::Exchange { detail } => assert!(detail.contains("expired")),
        other => panic!("expected Exchange, got {:?}", other),
    }
}

#[tokio::test]
async fn code_exchange_posts_the_authorization_code_grant() {
    setup();
    let (flow, handles) = mock_flow(test_config(), vec![token_reply("an-access-token")]);
    let tokens = flow
        .exchange_code("the-code", "the-verifier")
        .await
        .expect("code exchange");

    assert_eq!(tokens.access.as_deref(), Some("an-access-token"));
    assert_eq!(tokens.refresh.as_deref(), Some("a-refresh-token"));
    assert!(tokens.access_expires_at.unwrap() > Utc::now());
    assert!(tokens.refresh_expires_at.unwrap() > tokens.access_expires_at.unwrap());

    let form = handles.form(0);
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "the-code");
    assert_eq!(form["code_verifier"], "the-verifier");
    assert_eq!(form["client_id"], "aerie-ui");
    assert_eq!(form["redirect_uri"], "https://app.example.com/auth/callback");
    assert!(!form.contains_key("client_secret"));
}

#[tokio::test]
async fn confidential_clients_post_their_secret_but_never_leak_it() {
    setup();
    let mut config = test_config();
    config.client_secret = Some("hunter2".to_string());
    let (flow, handles) = mock_flow(
        config,
        vec![TransportReply {
            status: 400,
            body: json!({
                "error": "invalid_grant",
                "error_description": "code has expired",
            })
            .to_string(),
        }],
    );

    let err = flow
        .exchange_code("stale-code", "the-verifier")
        .await
        .unwrap_err();
    match err {
        AuthError::Exchange { detail } => {
            assert!(detail.contains("invalid_grant"));
            assert!(detail.contains("code has expired"));
            assert!(!detail.contains("hunter2"));
        }
        other => panic!("expected Exchange, got {:?}", other),
    }
    // The grant itself did carry the secret.
    assert_eq!(handles.form(0)["client_secret"], "hunter2");
}

#[tokio::test]
async fn refresh_rejections_are_classified_by_cause() {
    setup();
    let (flow, handles) = mock_flow(
        test_config(),
        vec![
            TransportReply {
                status: 400,
                body: json!({"error": "invalid_grant"}).to_string(),
            },
            TransportReply {
                status: 503,
                body: json!({"error": "temporarily_unavailable"}).to_string(),
            },
            TransportReply {
                status: 401,
                body: json!({"error": "invalid_client"}).to_string(),
            },
        ],
    );

    match flow.refresh_tokens("dead-token").await.unwrap_err() {
        AuthError::Refresh { kind, .. } => assert_eq!(kind, RefreshErrorKind::Rejected),
        other => panic!("expected Refresh, got {:?}", other),
    }
    match flow.refresh_tokens("some-token").await.unwrap_err() {
        AuthError::Refresh { kind, .. } => assert_eq!(kind, RefreshErrorKind::Transient),
        other => panic!("expected Refresh, got {:?}", other),
    }
    // A misconfigured client is a deployment problem, not a dead token: it
    // must not cascade into forced re-logins.
    match flow.refresh_tokens("some-token").await.unwrap_err() {
        AuthError::Refresh { kind, .. } => assert_eq!(kind, RefreshErrorKind::Transient),
        other => panic!("expected Refresh, got {:?}", other),
    }
    assert_eq!(handles.calls.load(Ordering::SeqCst), 3);
    assert_eq!(handles.form(0)["grant_type"], "refresh_token");
    assert_eq!(handles.form(0)["refresh_token"], "dead-token");
}

#[tokio::test]
async fn unresponsive_token_endpoint_surfaces_a_timeout() {
    setup();
    // A bound listener that never accepts: the connection lands in the
    // kernel backlog and the request waits until the client deadline.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let endpoint = format!("http://{}/token", listener.local_addr().unwrap());

    let transport = HttpTokenTransport::new(Duration::from_millis(200)).expect("transport");
    let err = transport
        .post_form(&endpoint, &[("grant_type", "refresh_token".to_string())])
        .await
        .unwrap_err();
    match err {
        AuthError::Timeout { operation } => assert_eq!(operation, "token endpoint request"),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn exchanged_tokens_verify_with_their_claims_intact() {
    setup();
    let claims = json!({
        "iss": ISSUER,
        "aud": "aerie",
        "sub": "user-1",
        "exp": Utc::now().timestamp() + 3600,
        "resource_access": {"aerie-ui": {"roles": ["aerie-user"]}},
    });
    let access_token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET),
    )
    .expect("token encoding");

    let (flow, _) = mock_flow(test_config(), vec![token_reply(&access_token)]);
    let tokens = flow
        .exchange_code("the-code", "the-verifier")
        .await
        .expect("code exchange");

    let resolver = Arc::new(KeyResolver::Static(
        StaticKeys::from_secret(SECRET, Algorithm::HS256).expect("static key"),
    ));
    let policy = VerificationPolicy::new(ISSUER)
        .with_audiences(vec!["aerie".to_string()])
        .with_algorithms(vec![Algorithm::HS256]);
    let verifier = Verifier::new(resolver, policy);

    let verified = verifier
        .verify(tokens.access.as_deref().expect("access token"))
        .await
        .expect("verification");
    assert_eq!(verified.subject(), Some("user-1"));
    assert_eq!(
        verified.claim_path(&["resource_access", "aerie-ui", "roles"]),
        Some(&json!(["aerie-user"]))
    );
}
