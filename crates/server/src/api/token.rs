//! The `/token` endpoint.
//!
//! `GET /token` implements the Docker registry token flow: optional HTTP
//! Basic credentials, repeated `scope` query parameters. `POST /token`
//! implements the OAuth2 flow with the `password` and `refresh_token`
//! grants. Both hand a [`TokenRequest`] to the [`TokenService`] and are the
//! only place where an [`AuthError`] becomes an HTTP status.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Form, Json,
    extract::{RawQuery, State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::auth::authn::Credential;
use crate::auth::scope::{join_scopes, parse_scopes};
use crate::auth::service::{TokenRequest, TokenResponse, TokenService};
use crate::config::ServerConfig;
use crate::error::AuthError;

/// Tag for OpenAPI documentation.
pub const TOKEN_TAG: &str = "Token";

#[derive(Clone)]
pub struct TokenServerState {
    pub service: Arc<dyn TokenService>,
    /// Sent in the Basic challenge when GET credentials are rejected.
    pub realm: String,
    pub request_timeout: Duration,
    /// Issue a new refresh token on every `refresh_token` grant.
    pub rotate_refresh_tokens: bool,
}

impl TokenServerState {
    pub fn new(service: Arc<dyn TokenService>, server: &ServerConfig) -> Self {
        Self {
            service,
            realm: server.realm.clone(),
            request_timeout: server.request_timeout(),
            rotate_refresh_tokens: server.rotate_refresh_tokens,
        }
    }
}

/// Creates the token router.
pub fn router(state: TokenServerState) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(get_token, post_token))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Token response of the Docker registry flow.
#[derive(Debug, Serialize, ToSchema)]
pub struct DockerTokenResponse {
    /// The access token. Older clients read this field.
    pub token: String,
    /// Same value as `token`.
    pub access_token: String,
    /// Lifetime of the access token in seconds.
    pub expires_in: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    /// Present when `offline_token=true` was requested by an authenticated
    /// client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// OAuth2 token request body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OAuth2TokenRequest {
    /// `password` or `refresh_token`.
    pub grant_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
    /// Space separated scopes.
    pub scope: Option<String>,
    /// Audience of the access token.
    pub service: Option<String>,
    pub client_id: Option<String>,
    pub access_type: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OAuth2TokenResponse {
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    pub expires_in: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    /// Granted scopes, space separated.
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Query parameters of the Docker flow. `scope` may repeat, which the
/// `Query` extractor cannot express.
#[derive(Debug, Default)]
struct DockerTokenParams {
    service: Option<String>,
    scopes: Vec<String>,
    offline_token: bool,
    client_id: Option<String>,
    account: Option<String>,
}

impl DockerTokenParams {
    fn parse(query: &str) -> Self {
        let mut params = Self::default();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "scope" => params.scopes.push(value.into_owned()),
                "service" => params.service = non_empty(value.into_owned()),
                "offline_token" => params.offline_token = value.eq_ignore_ascii_case("true"),
                "client_id" => params.client_id = non_empty(value.into_owned()),
                "account" => params.account = non_empty(value.into_owned()),
                _ => {}
            }
        }

        params
    }
}

#[derive(Clone, Copy)]
enum Flow {
    Docker,
    OAuth2,
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

// =============================================================================
// Endpoints
// =============================================================================

/// Docker registry token endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/token",
    tag = TOKEN_TAG,
    operation_id = "Docker Token",
    summary = "Issue a registry access token",
    description = "Docker registry token flow. Credentials are taken from HTTP Basic auth; without them \
                   the request is served for the anonymous subject.\n\n\
                   Requested scopes that the subject may not access are dropped from the token rather \
                   than failing the request, so a successful response can grant less than was asked for.",
    params(
        ("scope" = Option<Vec<String>>, Query, description = "Requested scope, `type:name:actions`. May repeat and may hold several space separated scopes."),
        ("service" = Option<String>, Query, description = "Name of the service the token is for. Becomes the token audience."),
        ("offline_token" = Option<bool>, Query, description = "Also return a refresh token."),
        ("client_id" = Option<String>, Query, description = "Client identifier, informational."),
        ("account" = Option<String>, Query, description = "Account name, informational."),
    ),
    responses(
        (status = 200, description = "Token issued", body = DockerTokenResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 408, description = "Request cancelled before a token was issued", body = ErrorResponse),
        (status = 500, description = "Server error", body = ErrorResponse),
    ),
    security((), ("basic" = []))
)]
pub async fn get_token(
    State(state): State<TokenServerState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let params = DockerTokenParams::parse(query.as_deref().unwrap_or_default());
    tracing::debug!(
        client_id = params.client_id.as_deref().unwrap_or_default(),
        account = params.account.as_deref().unwrap_or_default(),
        "docker token request"
    );

    let request = basic_credentials(&headers).and_then(|basic| {
        Ok(TokenRequest {
            credential: basic.map(|(username, password)| Credential::Password { username, password }),
            service: params.service,
            scopes: parse_scopes(params.scopes.iter().map(String::as_str))?,
            issue_refresh_token: params.offline_token,
        })
    });

    let response = match request {
        Ok(request) => issue(&state, request).await,
        Err(err) => Err(err),
    };

    match response {
        Ok(response) => Json(DockerTokenResponse {
            token: response.access_token.clone(),
            access_token: response.access_token,
            expires_in: response.expires_in,
            issued_at: response.issued_at,
            refresh_token: response.refresh_token,
        })
        .into_response(),
        Err(err) => error_response(Flow::Docker, &state, err),
    }
}

/// OAuth2 token endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/token",
    tag = TOKEN_TAG,
    operation_id = "OAuth2 Token",
    summary = "Exchange credentials for a registry access token",
    description = "OAuth2 token flow with the `password` and `refresh_token` grants.\n\n\
                   The `password` grant always returns a refresh token. Redeeming a refresh token \
                   re-authorizes the subject from scratch and returns a new refresh token only when \
                   rotation is enabled.",
    request_body(content = OAuth2TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token issued", body = OAuth2TokenResponse),
        (status = 400, description = "Malformed request or unsupported grant type", body = ErrorResponse),
        (status = 401, description = "Invalid credentials or refresh token", body = ErrorResponse),
        (status = 408, description = "Request cancelled before a token was issued", body = ErrorResponse),
        (status = 500, description = "Server error", body = ErrorResponse),
    )
)]
pub async fn post_token(
    State(state): State<TokenServerState>,
    form: Result<Form<OAuth2TokenRequest>, FormRejection>,
) -> Response {
    let params = match form {
        Ok(Form(params)) => params,
        Err(rejection) => {
            return error_response(
                Flow::OAuth2,
                &state,
                AuthError::invalid_request(rejection.body_text()),
            );
        }
    };

    tracing::debug!(
        grant_type = params.grant_type.as_deref().unwrap_or_default(),
        client_id = params.client_id.as_deref().unwrap_or_default(),
        access_type = params.access_type.as_deref().unwrap_or_default(),
        "oauth2 token request"
    );

    let issue_refresh_token = match params.grant_type.as_deref().unwrap_or_default() {
        "password" => true,
        "refresh_token" => state.rotate_refresh_tokens,
        "" => {
            return error_response(
                Flow::OAuth2,
                &state,
                AuthError::invalid_request("grant_type is required"),
            );
        }
        other => return unsupported_grant_type(other),
    };

    let request = oauth2_credential(&params).and_then(|credential| {
        Ok(TokenRequest {
            credential: Some(credential),
            service: params.service.clone().and_then(non_empty),
            scopes: parse_scopes(params.scope.as_deref())?,
            issue_refresh_token,
        })
    });

    let response = match request {
        Ok(request) => issue(&state, request).await,
        Err(err) => Err(err),
    };

    match response {
        Ok(response) => Json(OAuth2TokenResponse {
            access_token: response.access_token,
            token_type: "Bearer".to_string(),
            expires_in: response.expires_in,
            issued_at: response.issued_at,
            scope: join_scopes(&response.scopes),
            refresh_token: response.refresh_token,
        })
        .into_response(),
        Err(err) => error_response(Flow::OAuth2, &state, err),
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Runs the service under the request deadline.
///
/// The cancellation token fires when the deadline passes or when this
/// future is dropped because the client went away.
async fn issue(state: &TokenServerState, request: TokenRequest) -> Result<TokenResponse, AuthError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let deadline = cancel.clone();
    let timeout = state.request_timeout;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(?timeout, "token request deadline passed");
                deadline.cancel();
            }
            _ = deadline.cancelled() => {}
        }
    });

    state.service.issue(request, &cancel).await
}

/// Decodes HTTP Basic credentials.
///
/// Other authorization schemes are ignored; a Basic header that does not
/// decode is a malformed request.
fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let Some(encoded) = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Basic ").or_else(|| v.strip_prefix("basic ")))
    else {
        return Ok(None);
    };

    let malformed = || AuthError::invalid_request("malformed basic authorization header");

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (username, password) = decoded.split_once(':').ok_or_else(malformed)?;

    if username.is_empty() {
        return Err(AuthError::invalid_request("basic authorization without username"));
    }

    Ok(Some((username.to_string(), password.to_string())))
}

fn require(value: &Option<String>, name: &str) -> Result<String, AuthError> {
    value
        .clone()
        .and_then(non_empty)
        .ok_or_else(|| AuthError::invalid_request(format!("{name} is required")))
}

fn oauth2_credential(params: &OAuth2TokenRequest) -> Result<Credential, AuthError> {
    match params.grant_type.as_deref() {
        Some("password") => Credential::from_parts(
            Some((require(&params.username, "username")?, require(&params.password, "password")?)),
            params.refresh_token.clone().and_then(non_empty),
        ),
        _ => {
            let password = match (&params.username, &params.password) {
                (Some(username), Some(password)) if !username.is_empty() => {
                    Some((username.clone(), password.clone()))
                }
                _ => None,
            };
            Credential::from_parts(password, Some(require(&params.refresh_token, "refresh_token")?))
        }
    }
}

fn error_response(flow: Flow, state: &TokenServerState, err: AuthError) -> Response {
    let (status, error, description) = match &err {
        AuthError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", Some(message.clone())),
        AuthError::AuthenticationFailed => match flow {
            Flow::Docker => (StatusCode::UNAUTHORIZED, "unauthorized", Some(err.to_string())),
            Flow::OAuth2 => (StatusCode::UNAUTHORIZED, "invalid_grant", Some(err.to_string())),
        },
        AuthError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "request_cancelled", None),
        // Details stay in the logs.
        AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
    };

    let mut response = json_error(status, error, description);

    if let (Flow::Docker, AuthError::AuthenticationFailed) = (flow, &err)
        && let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", state.realm))
    {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
    }

    response
}

// Rejected before a token request exists, so the service never logs it.
fn unsupported_grant_type(grant_type: &str) -> Response {
    tracing::warn!(grant_type, outcome = "unsupported_grant_type", "token request rejected");

    json_error(
        StatusCode::BAD_REQUEST,
        "unsupported_grant_type",
        Some(format!("grant type {grant_type:?} is not supported")),
    )
}

fn json_error(status: StatusCode, error: &str, description: Option<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            error_description: description,
        }),
    )
        .into_response()
}
