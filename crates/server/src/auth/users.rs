//! Static user list authentication.
//!
//! Users come from configuration with Argon2id password hashes in PHC
//! format. The same list answers subject lookups for the refresh token flow.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::authn::{PasswordAuthenticator, SubjectRepository};
use crate::auth::subject::Subject;
use crate::config::ConfigError;
use crate::error::AuthError;
use crate::registry::ComponentFactory;

/// Hash a password using Argon2id.
///
/// Returns the PHC-formatted hash string suitable for the `password_hash`
/// field of a user entry.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())?;
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash.
///
/// Returns true if the password matches.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// A configured user.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(alias = "passwordHash")]
    pub password_hash: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "attrs")]
    pub attributes: BTreeMap<String, String>,
}

impl User {
    fn subject(&self) -> Subject {
        Subject::new(self.username.clone())
            .with_enabled(self.enabled)
            .with_attributes(self.attributes.clone())
    }
}

/// Password authenticator over a fixed list of users.
pub struct UserAuthenticator {
    users: HashMap<String, User>,
    // Verified against when the username is unknown, so the response time
    // does not reveal which usernames exist.
    dummy_hash: String,
}

impl UserAuthenticator {
    pub fn new(entries: Vec<User>) -> Result<Self, argon2::password_hash::Error> {
        let users = entries
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();

        Ok(Self {
            users,
            dummy_hash: hash_password("registry-auth-dummy-password")?,
        })
    }
}

#[async_trait]
impl PasswordAuthenticator for UserAuthenticator {
    #[tracing::instrument(skip(self, password))]
    async fn authenticate(&self, username: &str, password: &str) -> Result<Subject, AuthError> {
        let user = self.users.get(username);

        let hash = match user {
            Some(user) => user.password_hash.clone(),
            None => self.dummy_hash.clone(),
        };
        let password = password.to_owned();

        // Argon2 is deliberately slow; keep it off the async workers.
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AuthError::internal(format!("password verification task failed: {e}")))?;

        match user {
            Some(user) if verified && user.enabled => Ok(user.subject()),
            _ => Err(AuthError::AuthenticationFailed),
        }
    }

    fn as_subject_repository(self: Arc<Self>) -> Option<Arc<dyn SubjectRepository>> {
        Some(self)
    }
}

#[async_trait]
impl SubjectRepository for UserAuthenticator {
    async fn find_subject(&self, id: &str) -> Result<Option<Subject>, AuthError> {
        Ok(self.users.get(id).map(User::subject))
    }
}

/// Configuration of the `user` password authenticator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserAuthenticatorConfig {
    #[serde(default)]
    pub entries: Vec<User>,
}

impl ComponentFactory<dyn PasswordAuthenticator> for UserAuthenticatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.username.is_empty() {
                return Err(ConfigError::invalid_component(
                    "user authenticator",
                    format!("entry[{i}]: username is required"),
                ));
            }

            if entry.password_hash.is_empty() {
                return Err(ConfigError::invalid_component(
                    "user authenticator",
                    format!("entry[{i}]: password hash is required"),
                ));
            }

            if PasswordHash::new(&entry.password_hash).is_err() {
                return Err(ConfigError::invalid_component(
                    "user authenticator",
                    format!("entry[{i}]: password hash is not a valid PHC string"),
                ));
            }

            if !seen.insert(entry.username.as_str()) {
                return Err(ConfigError::invalid_component(
                    "user authenticator",
                    format!("entry[{i}]: duplicate username {:?}", entry.username),
                ));
            }
        }

        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn PasswordAuthenticator>, ConfigError> {
        let authenticator = UserAuthenticator::new(self.entries.clone()).map_err(|e| {
            ConfigError::invalid_component("user authenticator", format!("preparing dummy hash: {e}"))
        })?;
        Ok(Arc::new(authenticator))
    }
}
