use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::authn::{Authenticator, PasswordAuthenticator};
use crate::auth::authz::Authorizer;
use crate::auth::service::{LoggingTokenService, TokenService, TokenServiceImpl};
use crate::auth::token::{AccessTokenIssuer, RefreshTokenIssuer, TokenIssuer};
use crate::registry::{self, FactoryRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("unknown {kind} type {name:?} (available: {available})")]
    UnknownComponentType {
        kind: &'static str,
        name: String,
        available: String,
    },
    #[error("invalid {kind} configuration: {message}")]
    InvalidComponent { kind: &'static str, message: String },
    #[error("missing capability: {0}")]
    MissingCapability(String),
}

impl ConfigError {
    pub fn invalid_component(kind: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidComponent {
            kind,
            message: message.into(),
        }
    }
}

/// Prefix of environment variables overriding file values, e.g.
/// `REGISTRY_AUTH__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "REGISTRY_AUTH";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Advertised in the `WWW-Authenticate` challenge of failed GET requests.
    #[serde(default)]
    pub realm: String,
    /// Deadline of a single token request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Hand out a fresh refresh token when one is redeemed.
    #[serde(default)]
    pub rotate_refresh_tokens: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_request_timeout() -> u64 {
    10
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Validation(format!("server.listen_addr {:?}: {e}", self.listen_addr)))
    }
}

/// A pluggable component: a registered `type` name plus its own opaque
/// `config` section, decoded by the factory registered under that name.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub password_authenticator: ComponentConfig,
    pub authorizer: ComponentConfig,
    pub access_token_issuer: ComponentConfig,
    pub refresh_token_issuer: ComponentConfig,
}

impl AppConfig {
    /// Checks the server section and that every component names a type.
    ///
    /// Component sections themselves are validated by their factories in
    /// [`build_components`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.realm.is_empty() {
            return Err(ConfigError::Validation("server.realm is required".into()));
        }
        if self.server.request_timeout == 0 {
            return Err(ConfigError::Validation("server.request_timeout must be > 0".into()));
        }
        self.server.socket_addr()?;

        for (section, component) in [
            ("password_authenticator", &self.password_authenticator),
            ("authorizer", &self.authorizer),
            ("access_token_issuer", &self.access_token_issuer),
            ("refresh_token_issuer", &self.refresh_token_issuer),
        ] {
            if component.kind.is_empty() {
                return Err(ConfigError::Validation(format!("{section}.type is required")));
            }
        }

        Ok(())
    }
}

/// Load configuration from a YAML file plus `REGISTRY_AUTH__*` environment
/// overrides.
///
/// `overrides` are applied last, for values given on the command line.
pub fn load_config(path: &Path, overrides: &[(&str, String)]) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};

    let mut builder = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
    for (key, value) in overrides {
        builder = builder.set_override(*key, value.as_str())?;
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Parse configuration from a YAML document, without environment overrides.
pub fn parse_config(yaml: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, File, FileFormat};

    let app: AppConfig = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// The four configured components, built and ready to wire.
#[derive(Clone)]
pub struct Components {
    pub password_authenticator: Arc<dyn PasswordAuthenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub access_token_issuer: Arc<dyn AccessTokenIssuer>,
    pub refresh_token_issuer: Arc<dyn RefreshTokenIssuer>,
}

impl Components {
    /// Wires the components into the logged token service.
    ///
    /// Fails when the password authenticator cannot look subjects up or the
    /// refresh token issuer cannot verify its tokens.
    pub fn into_token_service(self) -> Result<Arc<dyn TokenService>, ConfigError> {
        let authenticator =
            Authenticator::from_components(self.password_authenticator, self.refresh_token_issuer.clone())?;

        let service = TokenServiceImpl::new(
            authenticator,
            self.authorizer,
            TokenIssuer {
                access: self.access_token_issuer,
                refresh: self.refresh_token_issuer,
            },
        );

        Ok(Arc::new(LoggingTokenService::new(Arc::new(service))))
    }
}

/// Resolves every component against the factory registry, validates all of
/// them and only then builds them.
pub fn build_components(config: &AppConfig) -> Result<Components, ConfigError> {
    let password_authenticator = instantiate(registry::password_authenticators(), &config.password_authenticator)?;
    let authorizer = instantiate(registry::authorizers(), &config.authorizer)?;
    let access_token_issuer = instantiate(registry::access_token_issuers(), &config.access_token_issuer)?;
    let refresh_token_issuer = instantiate(registry::refresh_token_issuers(), &config.refresh_token_issuer)?;

    password_authenticator.validate()?;
    authorizer.validate()?;
    access_token_issuer.validate()?;
    refresh_token_issuer.validate()?;

    let components = Components {
        password_authenticator: password_authenticator.build()?,
        authorizer: authorizer.build()?,
        access_token_issuer: access_token_issuer.build()?,
        refresh_token_issuer: refresh_token_issuer.build()?,
    };

    tracing::debug!(
        password_authenticator = %config.password_authenticator.kind,
        authorizer = %config.authorizer.kind,
        access_token_issuer = %config.access_token_issuer.kind,
        refresh_token_issuer = %config.refresh_token_issuer.kind,
        "components built"
    );

    Ok(components)
}

fn instantiate<T: ?Sized + 'static>(
    registry: &FactoryRegistry<T>,
    component: &ComponentConfig,
) -> Result<Box<dyn registry::ComponentFactory<T>>, ConfigError> {
    registry.instantiate(&component.kind, component.config.clone())
}
