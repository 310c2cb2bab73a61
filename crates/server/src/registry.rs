//! Component factory registry.
//!
//! Configuration selects every pluggable component by a `type` name. Each
//! component kind has one process-wide [`FactoryRegistry`] mapping those
//! names to decoders that turn the component's raw `config` section into a
//! [`ComponentFactory`].
//!
//! Registration happens once, before the HTTP listener starts; afterwards the
//! registries are only read. Registering the same name twice is a
//! programming error and panics.

use std::collections::BTreeMap;
use std::sync::{Arc, Once, PoisonError, RwLock};

use serde::de::DeserializeOwned;

use crate::auth::authn::PasswordAuthenticator;
use crate::auth::authz::{AllowAllAuthorizerConfig, Authorizer, StaticAuthorizerConfig};
use crate::auth::token::{
    AccessTokenIssuer, JwtAccessTokenIssuerConfig, JwtRefreshTokenIssuerConfig, RefreshTokenIssuer,
};
use crate::auth::users::UserAuthenticatorConfig;
use crate::config::ConfigError;

/// A validated-then-built recipe for one component.
pub trait ComponentFactory<T: ?Sized>: Send + Sync {
    /// Checks the configuration without constructing anything.
    fn validate(&self) -> Result<(), ConfigError>;

    fn build(&self) -> Result<Arc<T>, ConfigError>;
}

/// Turns a component's raw configuration section into a factory.
pub type Decoder<T> = fn(serde_json::Value) -> Result<Box<dyn ComponentFactory<T>>, serde_json::Error>;

/// Decoder for any factory type that deserializes from its config section.
pub fn decode_factory<T, C>(value: serde_json::Value) -> Result<Box<dyn ComponentFactory<T>>, serde_json::Error>
where
    T: ?Sized,
    C: DeserializeOwned + ComponentFactory<T> + 'static,
{
    // A component without a `config` section is configured by its defaults.
    let value = match value {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };

    let factory: C = serde_json::from_value(value)?;
    Ok(Box::new(factory))
}

/// Name-keyed table of decoders for one component kind.
pub struct FactoryRegistry<T: ?Sized + 'static> {
    kind: &'static str,
    decoders: RwLock<BTreeMap<String, Decoder<T>>>,
}

impl<T: ?Sized + 'static> FactoryRegistry<T> {
    pub const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            decoders: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Makes `decoder` available under `name`.
    ///
    /// # Panics
    ///
    /// If `name` is empty or already registered.
    pub fn register(&self, name: &str, decoder: Decoder<T>) {
        if name.is_empty() {
            panic!("registering {} factory: name must not be empty", self.kind);
        }

        let mut decoders = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        if decoders.contains_key(name) {
            panic!("registering {} factory: {name:?} is already registered", self.kind);
        }
        decoders.insert(name.to_owned(), decoder);
    }

    pub fn resolve(&self, name: &str) -> Option<Decoder<T>> {
        self.decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Registered names in sorted order.
    pub fn registered_names(&self) -> Vec<String> {
        self.decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Resolves `name` and decodes `config` into a factory.
    pub fn instantiate(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn ComponentFactory<T>>, ConfigError> {
        let decoder = self
            .resolve(name)
            .ok_or_else(|| ConfigError::UnknownComponentType {
                kind: self.kind,
                name: name.to_owned(),
                available: self.registered_names().join(", "),
            })?;

        decoder(config).map_err(|e| ConfigError::invalid_component(self.kind, format!("{name}: {e}")))
    }
}

static PASSWORD_AUTHENTICATORS: FactoryRegistry<dyn PasswordAuthenticator> =
    FactoryRegistry::new("password authenticator");
static AUTHORIZERS: FactoryRegistry<dyn Authorizer> = FactoryRegistry::new("authorizer");
static ACCESS_TOKEN_ISSUERS: FactoryRegistry<dyn AccessTokenIssuer> =
    FactoryRegistry::new("access token issuer");
static REFRESH_TOKEN_ISSUERS: FactoryRegistry<dyn RefreshTokenIssuer> =
    FactoryRegistry::new("refresh token issuer");

pub fn password_authenticators() -> &'static FactoryRegistry<dyn PasswordAuthenticator> {
    &PASSWORD_AUTHENTICATORS
}

pub fn authorizers() -> &'static FactoryRegistry<dyn Authorizer> {
    &AUTHORIZERS
}

pub fn access_token_issuers() -> &'static FactoryRegistry<dyn AccessTokenIssuer> {
    &ACCESS_TOKEN_ISSUERS
}

pub fn refresh_token_issuers() -> &'static FactoryRegistry<dyn RefreshTokenIssuer> {
    &REFRESH_TOKEN_ISSUERS
}

/// Makes a password authenticator available by `name` in configuration.
///
/// Panics if `name` is taken.
pub fn register_password_authenticator_factory(name: &str, decoder: Decoder<dyn PasswordAuthenticator>) {
    PASSWORD_AUTHENTICATORS.register(name, decoder);
}

/// Makes an authorizer available by `name` in configuration.
///
/// Panics if `name` is taken.
pub fn register_authorizer_factory(name: &str, decoder: Decoder<dyn Authorizer>) {
    AUTHORIZERS.register(name, decoder);
}

/// Makes an access token issuer available by `name` in configuration.
///
/// Panics if `name` is taken.
pub fn register_access_token_issuer_factory(name: &str, decoder: Decoder<dyn AccessTokenIssuer>) {
    ACCESS_TOKEN_ISSUERS.register(name, decoder);
}

/// Makes a refresh token issuer available by `name` in configuration.
///
/// Panics if `name` is taken.
pub fn register_refresh_token_issuer_factory(name: &str, decoder: Decoder<dyn RefreshTokenIssuer>) {
    REFRESH_TOKEN_ISSUERS.register(name, decoder);
}

/// Registers the components shipped with this crate.
///
/// Must run before configuration is resolved; calling it again is a no-op.
pub fn register_builtin_factories() {
    static BUILTINS: Once = Once::new();

    BUILTINS.call_once(|| {
        register_password_authenticator_factory(
            "user",
            decode_factory::<dyn PasswordAuthenticator, UserAuthenticatorConfig>,
        );

        register_authorizer_factory("static", decode_factory::<dyn Authorizer, StaticAuthorizerConfig>);
        register_authorizer_factory(
            "allow_all",
            decode_factory::<dyn Authorizer, AllowAllAuthorizerConfig>,
        );

        register_access_token_issuer_factory(
            "jwt",
            decode_factory::<dyn AccessTokenIssuer, JwtAccessTokenIssuerConfig>,
        );
        register_refresh_token_issuer_factory(
            "jwt",
            decode_factory::<dyn RefreshTokenIssuer, JwtRefreshTokenIssuerConfig>,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    #[derive(serde::Deserialize)]
    struct HelloConfig {
        #[serde(default = "default_name")]
        name: String,
    }

    fn default_name() -> String {
        "world".into()
    }

    struct Hello(String);

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello {}", self.0)
        }
    }

    impl ComponentFactory<dyn Greeter> for HelloConfig {
        fn validate(&self) -> Result<(), ConfigError> {
            if self.name.is_empty() {
                return Err(ConfigError::invalid_component("greeter", "name is required"));
            }
            Ok(())
        }

        fn build(&self) -> Result<Arc<dyn Greeter>, ConfigError> {
            Ok(Arc::new(Hello(self.name.clone())))
        }
    }

    fn registry() -> FactoryRegistry<dyn Greeter> {
        let registry = FactoryRegistry::new("greeter");
        registry.register("hello", decode_factory::<dyn Greeter, HelloConfig>);
        registry
    }

    #[test]
    fn resolves_registered_factory() {
        let registry = registry();
        let factory = registry
            .instantiate("hello", serde_json::json!({"name": "registry"}))
            .unwrap();
        factory.validate().unwrap();
        assert_eq!(factory.build().unwrap().greet(), "hello registry");
    }

    #[test]
    fn missing_config_section_uses_defaults() {
        let factory = registry().instantiate("hello", serde_json::Value::Null).unwrap();
        assert_eq!(factory.build().unwrap().greet(), "hello world");
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let err = registry()
            .instantiate("goodbye", serde_json::Value::Null)
            .err()
            .expect("unknown type");
        match err {
            ConfigError::UnknownComponentType { kind, name, available } => {
                assert_eq!(kind, "greeter");
                assert_eq!(name, "goodbye");
                assert_eq!(available, "hello");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let err = registry()
            .instantiate("hello", serde_json::json!({"name": 42}))
            .err()
            .expect("bad config");
        assert!(matches!(err, ConfigError::InvalidComponent { kind: "greeter", .. }));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let registry = registry();
        registry.register("hello", decode_factory::<dyn Greeter, HelloConfig>);
    }

    #[test]
    #[should_panic(expected = "name must not be empty")]
    fn empty_name_panics() {
        registry().register("", decode_factory::<dyn Greeter, HelloConfig>);
    }

    #[test]
    fn builtins_register_once() {
        register_builtin_factories();
        register_builtin_factories();

        assert_eq!(password_authenticators().registered_names(), ["user"]);
        assert_eq!(authorizers().registered_names(), ["allow_all", "static"]);
        assert!(access_token_issuers().resolve("jwt").is_some());
        assert!(refresh_token_issuers().resolve("jwt").is_some());
    }
}
