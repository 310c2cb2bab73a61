//! Token issuance: authenticate, authorize, issue.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::auth::authn::{Authenticator, Credential};
use crate::auth::authz::Authorizer;
use crate::auth::scope::{Scope, is_subset, join_scopes};
use crate::auth::subject::Subject;
use crate::auth::token::TokenIssuer;
use crate::error::AuthError;

/// Everything needed to issue tokens for one request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    /// `None` authenticates as the anonymous subject.
    pub credential: Option<Credential>,
    /// Audience of the access token.
    pub service: Option<String>,
    pub scopes: Vec<Scope>,
    pub issue_refresh_token: bool,
}

/// The outcome of a successful issuance.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub subject: String,
    pub access_token: String,
    pub expires_in: u64,
    pub issued_at: OffsetDateTime,
    pub refresh_token: Option<String>,
    pub scopes: Vec<Scope>,
}

#[async_trait]
pub trait TokenService: Send + Sync {
    /// Runs the full pipeline. Either a complete response is produced or an
    /// error; a cancelled request never yields tokens.
    async fn issue(&self, request: TokenRequest, cancel: &CancellationToken) -> Result<TokenResponse, AuthError>;
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthError::Cancelled),
        result = fut => result,
    }
}

pub struct TokenServiceImpl {
    authenticator: Authenticator,
    authorizer: Arc<dyn Authorizer>,
    issuer: TokenIssuer,
}

impl TokenServiceImpl {
    pub fn new(authenticator: Authenticator, authorizer: Arc<dyn Authorizer>, issuer: TokenIssuer) -> Self {
        Self {
            authenticator,
            authorizer,
            issuer,
        }
    }
}

#[async_trait]
impl TokenService for TokenServiceImpl {
    async fn issue(&self, request: TokenRequest, cancel: &CancellationToken) -> Result<TokenResponse, AuthError> {
        let subject = match &request.credential {
            Some(credential) => cancellable(cancel, self.authenticator.authenticate(credential)).await?,
            None => Subject::anonymous(),
        };

        let granted = cancellable(cancel, self.authorizer.authorize(&subject, &request.scopes)).await?;
        if !is_subset(&granted, &request.scopes) {
            return Err(AuthError::internal(format!(
                "authorizer granted {:?} beyond the requested {:?}",
                join_scopes(&granted),
                join_scopes(&request.scopes)
            )));
        }

        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        let access = cancellable(
            cancel,
            self.issuer
                .access
                .issue_access_token(&subject, request.service.as_deref(), &granted),
        )
        .await?;

        // Anonymous subjects cannot be resolved again, so a refresh token
        // would be useless to them.
        let refresh_token = if request.issue_refresh_token && !subject.is_anonymous() {
            Some(cancellable(cancel, self.issuer.refresh.issue_refresh_token(&subject)).await?)
        } else {
            None
        };

        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        Ok(TokenResponse {
            subject: subject.id().to_owned(),
            access_token: access.token,
            expires_in: access.expires_in,
            issued_at: access.issued_at,
            refresh_token,
            scopes: granted,
        })
    }
}

/// Logs every issuance passing through the wrapped service.
pub struct LoggingTokenService {
    inner: Arc<dyn TokenService>,
}

impl LoggingTokenService {
    pub fn new(inner: Arc<dyn TokenService>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TokenService for LoggingTokenService {
    async fn issue(&self, request: TokenRequest, cancel: &CancellationToken) -> Result<TokenResponse, AuthError> {
        let grant_type = request
            .credential
            .as_ref()
            .map_or("anonymous", Credential::grant_type);
        let username = request
            .credential
            .as_ref()
            .and_then(Credential::username)
            .map(str::to_owned);
        let service = request.service.clone();
        let requested = join_scopes(&request.scopes);

        let result = self.inner.issue(request, cancel).await;

        match &result {
            Ok(response) => tracing::info!(
                grant_type,
                subject = %response.subject,
                service = service.as_deref().unwrap_or_default(),
                requested = %requested,
                granted = %join_scopes(&response.scopes),
                refresh_token = response.refresh_token.is_some(),
                "token issued"
            ),
            Err(AuthError::Internal(detail)) => tracing::error!(
                grant_type,
                username = username.as_deref().unwrap_or_default(),
                service = service.as_deref().unwrap_or_default(),
                requested = %requested,
                outcome = "internal",
                error = %detail,
                "token issuance failed"
            ),
            Err(err) => tracing::warn!(
                grant_type,
                username = username.as_deref().unwrap_or_default(),
                service = service.as_deref().unwrap_or_default(),
                requested = %requested,
                outcome = err.kind(),
                "token request rejected"
            ),
        }

        result
    }
}
