//! HTTP tests for the token endpoints.
//!
//! The server is assembled the same way the binary does it: YAML
//! configuration, the factory registry, then the router.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use registry_auth::{
    api::{self, TokenServerState},
    auth::{
        Scope, TokenRequest, TokenResponse, TokenService,
        token::{AccessClaims, REFRESH_TOKEN_USE, RefreshClaims},
        users::hash_password,
    },
    config::{ConfigError, ServerConfig, build_components, parse_config},
    error::AuthError,
    registry::register_builtin_factories,
};
use tokio_util::sync::CancellationToken;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const REALM: &str = "https://auth.example.com/token";

/// Argon2 is slow in debug builds; hash the shared password once.
fn password_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password("correct").expect("hash password"))
}

fn config_yaml(rotate_refresh_tokens: bool) -> String {
    format!(
        r#"
server:
  realm: "{REALM}"
  rotate_refresh_tokens: {rotate_refresh_tokens}
password_authenticator:
  type: user
  config:
    entries:
      - username: alice
        password_hash: "{hash}"
        enabled: true
      - username: bob
        password_hash: "{hash}"
        enabled: false
authorizer:
  type: static
  config:
    rules:
      - anonymous: true
        names: ["public/*"]
        actions: [pull]
      - subjects: [alice]
        names: ["foo", "alice/**"]
        actions: [pull, push]
access_token_issuer:
  type: jwt
  config:
    issuer: registry-auth
    audience: registry
    signing_key:
      secret: "{SECRET}"
refresh_token_issuer:
  type: jwt
  config:
    issuer: registry-auth
    signing_key:
      secret: "{SECRET}"
"#,
        hash = password_hash()
    )
}

fn server_with(rotate_refresh_tokens: bool) -> TestServer {
    register_builtin_factories();

    let config = parse_config(&config_yaml(rotate_refresh_tokens)).expect("parse config");
    let service = build_components(&config)
        .and_then(|components| components.into_token_service())
        .expect("build token service");

    let app = api::router(TokenServerState::new(service, &config.server));
    TestServer::new(app).expect("create test server")
}

fn server() -> TestServer {
    server_with(false)
}

fn basic(username: &str, password: &str) -> HeaderValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).expect("header value")
}

fn decode_access(token: &str) -> AccessClaims {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["registry"]);
    validation.set_issuer(&["registry-auth"]);
    decode::<AccessClaims>(token, &DecodingKey::from_secret(SECRET.as_bytes()), &validation)
        .expect("valid access token")
        .claims
}

fn granted(claims: &AccessClaims) -> Vec<String> {
    claims.access.iter().map(Scope::to_string).collect()
}

// =============================================================================
// POST /token
// =============================================================================

#[tokio::test]
async fn test_password_grant_issues_requested_scope() {
    let server = server();

    let response = server
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
            ("scope", "repository:foo:pull"),
            ("service", "registry"),
        ])
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["scope"], "repository:foo:pull");
    assert_eq!(body["expires_in"], 300);
    assert!(body["issued_at"].is_string());
    assert!(body["refresh_token"].is_string());

    let claims = decode_access(body["access_token"].as_str().unwrap());
    assert_eq!(claims.sub, "alice");
    assert_eq!(
        serde_json::to_value(&claims.access).unwrap(),
        serde_json::json!([{"type": "repository", "name": "foo", "actions": ["pull"]}])
    );
}

#[tokio::test]
async fn test_password_grant_narrows_scope() {
    let response = server()
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
            ("scope", "repository:foo:pull,push,delete repository:secret:pull"),
        ])
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["scope"], "repository:foo:pull,push");
    let claims = decode_access(body["access_token"].as_str().unwrap());
    assert_eq!(granted(&claims), ["repository:foo:pull,push"]);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let response = server()
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "wrong"),
            ("scope", "repository:foo:pull"),
        ])
        .await;

    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
    assert!(body.get("access_token").is_none());
}

#[tokio::test]
async fn test_unknown_and_disabled_users_look_alike() {
    let server = server();

    let mut bodies = Vec::new();
    for username in ["mallory", "bob"] {
        let response = server
            .post("/token")
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", "correct"),
            ])
            .await;
        response.assert_status_unauthorized();
        bodies.push(response.text());
    }

    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let response = server()
        .post("/token")
        .form(&[("grant_type", "device_code"), ("device_code", "abc")])
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_missing_fields_are_invalid_requests() {
    let server = server();

    let cases: [&[(&str, &str)]; 4] = [
        &[],
        &[("grant_type", "password"), ("username", "alice")],
        &[("grant_type", "refresh_token")],
        &[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
            ("scope", "repository"),
        ],
    ];

    for form in cases {
        let response = server.post("/token").form(form).await;
        response.assert_status_bad_request();
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "invalid_request", "{form:?}");
    }
}

#[tokio::test]
async fn test_refresh_token_round_trip() {
    let server = server();

    let first: serde_json::Value = server
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
        ])
        .await
        .json();
    let refresh_token = first["refresh_token"].as_str().unwrap();

    let response = server
        .post("/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", "repository:alice/app:push"),
        ])
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body.get("refresh_token").is_none());

    let claims = decode_access(body["access_token"].as_str().unwrap());
    assert_eq!(claims.sub, "alice");
    assert_eq!(granted(&claims), ["repository:alice/app:push"]);
}

#[tokio::test]
async fn test_refresh_token_rotation() {
    let server = server_with(true);

    let first: serde_json::Value = server
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
        ])
        .await
        .json();

    let second: serde_json::Value = server
        .post("/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", first["refresh_token"].as_str().unwrap()),
        ])
        .await
        .json();

    assert!(second["refresh_token"].is_string());
    assert_ne!(second["refresh_token"], first["refresh_token"]);
}

#[tokio::test]
async fn test_expired_refresh_token_is_rejected() {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let claims = RefreshClaims {
        iss: "registry-auth".into(),
        sub: "alice".into(),
        exp: now - 60,
        nbf: now - 3600,
        iat: now - 3600,
        jti: "expired".into(),
        token_use: REFRESH_TOKEN_USE.into(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    let response = server()
        .post("/token")
        .form(&[("grant_type", "refresh_token"), ("refresh_token", token.as_str())])
        .await;

    response.assert_status_unauthorized();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_access_token_is_not_a_refresh_token() {
    let server = server();

    let first: serde_json::Value = server
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
        ])
        .await
        .json();

    let response = server
        .post("/token")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", first["access_token"].as_str().unwrap()),
        ])
        .await;

    response.assert_status_unauthorized();
}

// =============================================================================
// GET /token
// =============================================================================

#[tokio::test]
async fn test_anonymous_push_gets_empty_grant() {
    let response = server()
        .get("/token")
        .add_query_param("service", "registry")
        .add_query_param("scope", "repository:foo:push")
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["token"], body["access_token"]);
    assert!(body.get("refresh_token").is_none());

    let claims = decode_access(body["token"].as_str().unwrap());
    assert_eq!(claims.sub, "");
    assert!(claims.access.is_empty());
}

#[tokio::test]
async fn test_anonymous_pull_of_public_repository() {
    let response = server()
        .get("/token")
        .add_query_param("service", "registry")
        .add_query_param("scope", "repository:public/alpine:pull,push")
        .add_query_param("offline_token", "true")
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body.get("refresh_token").is_none());
    let claims = decode_access(body["token"].as_str().unwrap());
    assert_eq!(granted(&claims), ["repository:public/alpine:pull"]);
}

#[tokio::test]
async fn test_basic_auth_with_repeated_scopes() {
    let response = server()
        .get("/token")
        .add_header(header::AUTHORIZATION, basic("alice", "correct"))
        .add_query_param("service", "registry")
        .add_query_param("scope", "repository:foo:pull")
        .add_query_param("scope", "repository:alice/app:pull,push")
        .add_query_param("offline_token", "true")
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert!(body["refresh_token"].is_string());
    assert_eq!(body["expires_in"], 300);

    let claims = decode_access(body["token"].as_str().unwrap());
    assert_eq!(claims.sub, "alice");
    assert_eq!(granted(&claims), ["repository:foo:pull", "repository:alice/app:pull,push"]);
}

#[tokio::test]
async fn test_wrong_basic_credentials_challenge() {
    let response = server()
        .get("/token")
        .add_header(header::AUTHORIZATION, basic("alice", "wrong"))
        .add_query_param("scope", "repository:foo:pull")
        .await;

    response.assert_status_unauthorized();
    assert_eq!(
        response.header(header::WWW_AUTHENTICATE),
        format!("Basic realm=\"{REALM}\"")
    );
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_malformed_scope_is_bad_request() {
    let response = server()
        .get("/token")
        .add_query_param("scope", "repository:foo")
        .await;

    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "invalid_request");
}

// =============================================================================
// Deadlines and miscellaneous routes
// =============================================================================

/// Waits for cancellation; stands in for a hung credential store.
struct HangingService;

#[async_trait]
impl TokenService for HangingService {
    async fn issue(&self, _request: TokenRequest, cancel: &CancellationToken) -> Result<TokenResponse, AuthError> {
        cancel.cancelled().await;
        Err(AuthError::Cancelled)
    }
}

#[tokio::test]
async fn test_request_deadline_cancels_issuance() {
    let state = TokenServerState {
        service: Arc::new(HangingService),
        realm: REALM.into(),
        request_timeout: Duration::from_millis(50),
        rotate_refresh_tokens: false,
    };
    let server = TestServer::new(api::router(state)).expect("create test server");

    let response = server
        .post("/token")
        .form(&[
            ("grant_type", "password"),
            ("username", "alice"),
            ("password", "correct"),
        ])
        .await;

    response.assert_status(StatusCode::REQUEST_TIMEOUT);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "request_cancelled");
}

#[tokio::test]
async fn test_health_and_docs() {
    let server = server();

    let response = server.get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("ok");

    server.get("/api-docs").await.assert_status_ok();
}

#[test]
fn test_server_config_defaults() {
    let server: ServerConfig = serde_json::from_value(serde_json::json!({"realm": REALM})).unwrap();
    let state = TokenServerState::new(Arc::new(HangingService), &server);
    assert_eq!(state.request_timeout, Duration::from_secs(10));
    assert!(!state.rotate_refresh_tokens);
}

#[test]
fn test_unknown_component_type_fails_startup() {
    register_builtin_factories();

    let yaml = config_yaml(false).replace("type: static", "type: ldap");
    let config = parse_config(&yaml).unwrap();

    let err = build_components(&config).err().expect("unknown authorizer");
    assert!(matches!(err, ConfigError::UnknownComponentType { kind: "authorizer", .. }), "{err}");
}
