//! Authentication: turning credential material into a [`Subject`].
//!
//! Two credential kinds exist: a username/password pair (the `password`
//! grant and HTTP Basic auth) and a refresh token previously issued by this
//! server. [`Credential`] captures which one a request carries and
//! [`Authenticator`] dispatches it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::subject::Subject;
use crate::auth::token::RefreshTokenIssuer;
use crate::config::ConfigError;
use crate::error::AuthError;

/// Authenticates a subject using the `password` grant or Basic auth.
///
/// Implementations return [`AuthError::AuthenticationFailed`] only when the
/// credentials are wrong (unknown user, bad password, disabled account).
/// Anything else, such as an unreachable store, must come back as a
/// different error.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Subject, AuthError>;

    /// Returns this authenticator as a [`SubjectRepository`] if it can look
    /// subjects up by id.
    fn as_subject_repository(self: Arc<Self>) -> Option<Arc<dyn SubjectRepository>> {
        None
    }
}

/// Looks up the current state of a subject by its identifier.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
    /// Returns `Ok(None)` when no such subject exists.
    async fn find_subject(&self, id: &str) -> Result<Option<Subject>, AuthError>;
}

/// Validates a refresh token and extracts the id of the subject it was
/// issued to.
#[async_trait]
pub trait RefreshTokenVerifier: Send + Sync {
    async fn verify_refresh_token(&self, token: &str) -> Result<String, AuthError>;
}

/// Authenticates a subject by a refresh token.
///
/// The subject is re-resolved on every redemption, so disabling an account
/// invalidates all of its outstanding refresh tokens.
#[derive(Clone)]
pub struct RefreshTokenAuthenticator {
    verifier: Arc<dyn RefreshTokenVerifier>,
    repository: Arc<dyn SubjectRepository>,
}

impl RefreshTokenAuthenticator {
    pub fn new(verifier: Arc<dyn RefreshTokenVerifier>, repository: Arc<dyn SubjectRepository>) -> Self {
        Self {
            verifier,
            repository,
        }
    }

    pub async fn authenticate(&self, refresh_token: &str) -> Result<Subject, AuthError> {
        let subject_id = self.verifier.verify_refresh_token(refresh_token).await?;

        match self.repository.find_subject(&subject_id).await? {
            Some(subject) if subject.is_enabled() && subject.id() == subject_id => Ok(subject),
            Some(_) => {
                tracing::debug!(subject = %subject_id, "refresh token owner is disabled");
                Err(AuthError::AuthenticationFailed)
            }
            None => {
                tracing::debug!(subject = %subject_id, "refresh token owner no longer exists");
                Err(AuthError::AuthenticationFailed)
            }
        }
    }
}

/// Credential material carried by a token request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password { username: String, password: String },
    RefreshToken(String),
}

impl Credential {
    /// Builds a credential from whatever the request supplied.
    ///
    /// Exactly one of the two kinds must be present.
    pub fn from_parts(
        password: Option<(String, String)>,
        refresh_token: Option<String>,
    ) -> Result<Self, AuthError> {
        match (password, refresh_token) {
            (Some((username, password)), None) => Ok(Credential::Password { username, password }),
            (None, Some(token)) => Ok(Credential::RefreshToken(token)),
            (Some(_), Some(_)) => Err(AuthError::invalid_request(
                "both password and refresh token credentials supplied",
            )),
            (None, None) => Err(AuthError::invalid_request("no credentials supplied")),
        }
    }

    /// Name of the grant this credential belongs to.
    pub fn grant_type(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::RefreshToken(_) => "refresh_token",
        }
    }

    /// The claimed username, if the credential carries one.
    pub fn username(&self) -> Option<&str> {
        match self {
            Credential::Password { username, .. } => Some(username),
            Credential::RefreshToken(_) => None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::RefreshToken(_) => f.debug_tuple("RefreshToken").field(&"<redacted>").finish(),
        }
    }
}

/// Dispatches a [`Credential`] to the matching authentication path.
#[derive(Clone)]
pub struct Authenticator {
    password: Arc<dyn PasswordAuthenticator>,
    refresh_token: RefreshTokenAuthenticator,
}

impl Authenticator {
    pub fn new(password: Arc<dyn PasswordAuthenticator>, refresh_token: RefreshTokenAuthenticator) -> Self {
        Self {
            password,
            refresh_token,
        }
    }

    /// Assembles the authenticator from configured components.
    ///
    /// The password authenticator must also act as the subject repository
    /// and the refresh token issuer must be able to verify its own tokens.
    /// Either capability missing is a startup error.
    pub fn from_components(
        password: Arc<dyn PasswordAuthenticator>,
        refresh_token_issuer: Arc<dyn RefreshTokenIssuer>,
    ) -> Result<Self, ConfigError> {
        let verifier = refresh_token_issuer.as_refresh_token_verifier().ok_or_else(|| {
            ConfigError::MissingCapability("refresh token issuer cannot verify refresh tokens".into())
        })?;

        let repository = password.clone().as_subject_repository().ok_or_else(|| {
            ConfigError::MissingCapability(
                "password authenticator cannot serve as a subject repository".into(),
            )
        })?;

        Ok(Self::new(
            password,
            RefreshTokenAuthenticator::new(verifier, repository),
        ))
    }

    pub async fn authenticate(&self, credential: &Credential) -> Result<Subject, AuthError> {
        match credential {
            Credential::Password { username, password } => {
                self.password.authenticate(username, password).await
            }
            Credential::RefreshToken(token) => self.refresh_token.authenticate(token).await,
        }
    }
}
