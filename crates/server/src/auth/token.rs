//! Access and refresh token issuance.
//!
//! Both token kinds are JWTs. Access tokens follow the registry token
//! format: the granted scopes travel in an `access` claim. Refresh tokens
//! carry no scope at all; redeeming one re-runs authorization, so privileges
//! are never cached in them.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::authn::RefreshTokenVerifier;
use crate::auth::scope::Scope;
use crate::auth::subject::Subject;
use crate::config::ConfigError;
use crate::error::AuthError;
use crate::registry::ComponentFactory;

/// Value of the `token_use` claim that marks refresh tokens.
pub const REFRESH_TOKEN_USE: &str = "refresh";

/// Upper bound on any configured token lifetime, in seconds (one year).
pub const MAX_EXPIRATION: u64 = 365 * 24 * 60 * 60;

/// Computes the `exp` claim for a token issued at `iat`.
fn expires_at(iat: i64, expiration: u64) -> Result<i64, AuthError> {
    i64::try_from(expiration)
        .ok()
        .and_then(|lifetime| iat.checked_add(lifetime))
        .ok_or_else(|| AuthError::internal(format!("token lifetime {expiration}s is out of range")))
}

fn validate_expiration(expiration: u64) -> Result<(), String> {
    if expiration == 0 {
        return Err("expiration must be > 0".into());
    }
    if expiration > MAX_EXPIRATION {
        return Err(format!("expiration must be at most {MAX_EXPIRATION} seconds"));
    }
    Ok(())
}

/// A signed access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    pub issued_at: OffsetDateTime,
}

#[async_trait]
pub trait AccessTokenIssuer: Send + Sync {
    /// Signs an access token for `subject` granting exactly `scopes`.
    ///
    /// `audience` is the service the token is meant for, when the client
    /// named one.
    async fn issue_access_token(
        &self,
        subject: &Subject,
        audience: Option<&str>,
        scopes: &[Scope],
    ) -> Result<AccessToken, AuthError>;
}

#[async_trait]
pub trait RefreshTokenIssuer: Send + Sync {
    async fn issue_refresh_token(&self, subject: &Subject) -> Result<String, AuthError>;

    /// Returns this issuer as a [`RefreshTokenVerifier`] if it can validate
    /// the tokens it issues.
    fn as_refresh_token_verifier(self: Arc<Self>) -> Option<Arc<dyn RefreshTokenVerifier>> {
        None
    }
}

/// The pair of issuers used for one token response.
#[derive(Clone)]
pub struct TokenIssuer {
    pub access: Arc<dyn AccessTokenIssuer>,
    pub refresh: Arc<dyn RefreshTokenIssuer>,
}

/// Claims of an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub access: Vec<Scope>,
}

/// Claims of a refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub token_use: String,
}

/// Key material for signing and, for refresh tokens, verification.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeyConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Shared secret for the HMAC algorithms.
    pub secret: Option<String>,
    /// PEM encoded private key, inline or from a file.
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    /// PEM encoded public key, inline or from a file.
    pub public_key: Option<String>,
    pub public_key_file: Option<PathBuf>,
    /// Written to the `kid` header.
    pub key_id: Option<String>,
}

fn default_algorithm() -> String {
    "HS256".into()
}

const MIN_SECRET_LEN: usize = 32;

/// Loaded signing key.
#[derive(Clone)]
pub struct SigningKey {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: Option<DecodingKey>,
    key_id: Option<String>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// HMAC key from a shared secret. Handy for tests and single node setups.
    pub fn hmac(algorithm: Algorithm, secret: &[u8]) -> Self {
        Self {
            algorithm,
            encoding: EncodingKey::from_secret(secret),
            decoding: Some(DecodingKey::from_secret(secret)),
            key_id: None,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn header(&self) -> Header {
        let mut header = Header::new(self.algorithm);
        header.kid = self.key_id.clone();
        header
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        encode(&self.header(), claims, &self.encoding)
            .map_err(|e| AuthError::internal(format!("signing token: {e}")))
    }
}

impl SigningKeyConfig {
    fn algorithm(&self) -> Result<Algorithm, String> {
        Algorithm::from_str(&self.algorithm).map_err(|_| format!("unsupported algorithm {:?}", self.algorithm))
    }

    fn pem(inline: &Option<String>, file: &Option<PathBuf>, what: &str) -> Result<Option<Vec<u8>>, String> {
        match (inline, file) {
            (Some(_), Some(_)) => Err(format!("{what} and {what}_file are mutually exclusive")),
            (Some(pem), None) => Ok(Some(pem.as_bytes().to_vec())),
            (None, Some(path)) => std::fs::read(path)
                .map(Some)
                .map_err(|e| format!("reading {what}_file {}: {e}", path.display())),
            (None, None) => Ok(None),
        }
    }

    /// Loads the key, requiring verification material when `verify` is set.
    pub fn load(&self, verify: bool) -> Result<SigningKey, String> {
        let algorithm = self.algorithm()?;

        if let Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 = algorithm {
            let secret = self
                .secret
                .as_deref()
                .ok_or_else(|| format!("secret is required for {:?}", algorithm))?;
            if secret.len() < MIN_SECRET_LEN {
                return Err(format!("secret must be at least {MIN_SECRET_LEN} bytes"));
            }
            let mut key = SigningKey::hmac(algorithm, secret.as_bytes());
            key.key_id = self.key_id.clone();
            return Ok(key);
        }

        let private = Self::pem(&self.private_key, &self.private_key_file, "private_key")?
            .ok_or_else(|| format!("private_key or private_key_file is required for {:?}", algorithm))?;
        let public = Self::pem(&self.public_key, &self.public_key_file, "public_key")?;

        let (encoding, decoding) = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => (
                EncodingKey::from_rsa_pem(&private),
                public.as_deref().map(DecodingKey::from_rsa_pem).transpose(),
            ),
            Algorithm::ES256 | Algorithm::ES384 => (
                EncodingKey::from_ec_pem(&private),
                public.as_deref().map(DecodingKey::from_ec_pem).transpose(),
            ),
            Algorithm::EdDSA => (
                EncodingKey::from_ed_pem(&private),
                public.as_deref().map(DecodingKey::from_ed_pem).transpose(),
            ),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => unreachable!("handled above"),
        };

        let encoding = encoding.map_err(|e| format!("invalid private key: {e}"))?;
        let decoding = decoding.map_err(|e| format!("invalid public key: {e}"))?;

        if verify && decoding.is_none() {
            return Err(format!(
                "public_key or public_key_file is required to verify {:?} tokens",
                algorithm
            ));
        }

        Ok(SigningKey {
            algorithm,
            encoding,
            decoding,
            key_id: self.key_id.clone(),
        })
    }
}

fn new_token_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Issues registry access tokens as signed JWTs.
pub struct JwtAccessTokenIssuer {
    issuer: String,
    audience: Option<String>,
    expiration: u64,
    key: SigningKey,
}

impl JwtAccessTokenIssuer {
    pub fn new(issuer: impl Into<String>, audience: Option<String>, expiration: u64, key: SigningKey) -> Self {
        Self {
            issuer: issuer.into(),
            audience,
            expiration,
            key,
        }
    }
}

#[async_trait]
impl AccessTokenIssuer for JwtAccessTokenIssuer {
    async fn issue_access_token(
        &self,
        subject: &Subject,
        audience: Option<&str>,
        scopes: &[Scope],
    ) -> Result<AccessToken, AuthError> {
        let now = OffsetDateTime::now_utc();
        let iat = now.unix_timestamp();

        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: subject.id().to_owned(),
            aud: audience.map(str::to_owned).or_else(|| self.audience.clone()),
            exp: expires_at(iat, self.expiration)?,
            nbf: iat,
            iat,
            jti: new_token_id(),
            access: scopes.to_vec(),
        };

        Ok(AccessToken {
            token: self.key.sign(&claims)?,
            expires_in: self.expiration,
            issued_at: now,
        })
    }
}

/// Issues refresh tokens as signed JWTs and verifies them on redemption.
pub struct JwtRefreshTokenIssuer {
    issuer: String,
    expiration: u64,
    key: SigningKey,
}

impl JwtRefreshTokenIssuer {
    pub fn new(issuer: impl Into<String>, expiration: u64, key: SigningKey) -> Self {
        Self {
            issuer: issuer.into(),
            expiration,
            key,
        }
    }
}

#[async_trait]
impl RefreshTokenIssuer for JwtRefreshTokenIssuer {
    async fn issue_refresh_token(&self, subject: &Subject) -> Result<String, AuthError> {
        let iat = OffsetDateTime::now_utc().unix_timestamp();

        let claims = RefreshClaims {
            iss: self.issuer.clone(),
            sub: subject.id().to_owned(),
            exp: expires_at(iat, self.expiration)?,
            nbf: iat,
            iat,
            jti: new_token_id(),
            token_use: REFRESH_TOKEN_USE.to_owned(),
        };

        self.key.sign(&claims)
    }

    fn as_refresh_token_verifier(self: Arc<Self>) -> Option<Arc<dyn RefreshTokenVerifier>> {
        // Without a decoding key the issuer cannot check its own tokens.
        self.key.decoding.is_some().then_some(self as Arc<dyn RefreshTokenVerifier>)
    }
}

#[async_trait]
impl RefreshTokenVerifier for JwtRefreshTokenIssuer {
    async fn verify_refresh_token(&self, token: &str) -> Result<String, AuthError> {
        let decoding = self
            .key
            .decoding
            .as_ref()
            .ok_or_else(|| AuthError::internal("refresh token issuer has no verification key"))?;

        let mut validation = Validation::new(self.key.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<RefreshClaims>(token, decoding, &validation).map_err(|e| {
            tracing::debug!(error = %e, "refresh token rejected");
            AuthError::AuthenticationFailed
        })?;

        if data.claims.token_use != REFRESH_TOKEN_USE || data.claims.sub.is_empty() {
            return Err(AuthError::AuthenticationFailed);
        }

        Ok(data.claims.sub)
    }
}

fn default_access_expiration() -> u64 {
    300
}

fn default_refresh_expiration() -> u64 {
    7 * 24 * 60 * 60
}

/// Configuration of the `jwt` access token issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtAccessTokenIssuerConfig {
    pub issuer: String,
    /// Audience used when the request does not name a service.
    #[serde(default)]
    pub audience: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default = "default_access_expiration")]
    pub expiration: u64,
    pub signing_key: SigningKeyConfig,
}

impl ComponentFactory<dyn AccessTokenIssuer> for JwtAccessTokenIssuerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::invalid_component("jwt access token issuer", message);

        if self.issuer.is_empty() {
            return Err(invalid("issuer is required".into()));
        }
        validate_expiration(self.expiration).map_err(invalid)?;
        self.signing_key.load(false).map_err(invalid)?;
        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn AccessTokenIssuer>, ConfigError> {
        let key = self
            .signing_key
            .load(false)
            .map_err(|e| ConfigError::invalid_component("jwt access token issuer", e))?;

        Ok(Arc::new(JwtAccessTokenIssuer::new(
            self.issuer.clone(),
            self.audience.clone(),
            self.expiration,
            key,
        )))
    }
}

/// Configuration of the `jwt` refresh token issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtRefreshTokenIssuerConfig {
    pub issuer: String,
    /// Token lifetime in seconds.
    #[serde(default = "default_refresh_expiration")]
    pub expiration: u64,
    pub signing_key: SigningKeyConfig,
}

impl ComponentFactory<dyn RefreshTokenIssuer> for JwtRefreshTokenIssuerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::invalid_component("jwt refresh token issuer", message);

        if self.issuer.is_empty() {
            return Err(invalid("issuer is required".into()));
        }
        validate_expiration(self.expiration).map_err(invalid)?;
        self.signing_key.load(true).map_err(invalid)?;
        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn RefreshTokenIssuer>, ConfigError> {
        let key = self
            .signing_key
            .load(true)
            .map_err(|e| ConfigError::invalid_component("jwt refresh token issuer", e))?;

        Ok(Arc::new(JwtRefreshTokenIssuer::new(
            self.issuer.clone(),
            self.expiration,
            key,
        )))
    }
}
