//! Authorization: narrowing requested scopes to what a subject may do.
//!
//! Every [`Authorizer`] must return a subset of the requested scopes: actions
//! may be removed and whole scopes dropped, nothing may be added. An empty
//! result is a valid outcome, not an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::scope::Scope;
use crate::auth::subject::Subject;
use crate::config::ConfigError;
use crate::error::AuthError;
use crate::registry::ComponentFactory;

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns the subset of `requested` that `subject` is permitted.
    ///
    /// Must be deterministic for a given `(subject, requested)` pair.
    async fn authorize(&self, subject: &Subject, requested: &[Scope]) -> Result<Vec<Scope>, AuthError>;
}

/// Grants every requested scope unchanged. Meant for development setups.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _subject: &Subject, requested: &[Scope]) -> Result<Vec<Scope>, AuthError> {
        Ok(requested.to_vec())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowAllAuthorizerConfig {}

impl ComponentFactory<dyn Authorizer> for AllowAllAuthorizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn Authorizer>, ConfigError> {
        tracing::warn!("allow_all authorizer grants every requested scope");
        Ok(Arc::new(AllowAllAuthorizer))
    }
}

/// One access rule of the [`StaticAuthorizer`].
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// Match only the anonymous subject.
    #[serde(default)]
    pub anonymous: bool,
    /// Subject ids the rule applies to; empty means any authenticated subject.
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Attributes the subject must carry with exactly these values.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    /// Resource name patterns. `*` matches within one path segment, `**`
    /// matches any number of segments and `{subject}` expands to the
    /// subject id.
    pub names: Vec<String>,
    /// Granted actions; `*` grants whatever was requested.
    pub actions: Vec<String>,
}

fn default_resource_type() -> String {
    "repository".into()
}

impl Rule {
    fn matches_subject(&self, subject: &Subject) -> bool {
        if self.anonymous {
            return subject.is_anonymous();
        }

        if subject.is_anonymous() {
            return false;
        }

        let subject_ok = self.subjects.is_empty() || self.subjects.iter().any(|s| s == subject.id());
        let attributes_ok = self
            .attributes
            .iter()
            .all(|(key, value)| subject.attribute(key) == Some(value.as_str()));

        subject_ok && attributes_ok
    }

    fn matches_resource(&self, subject: &Subject, scope: &Scope) -> bool {
        scope.resource_type() == self.resource_type
            && self.names.iter().any(|pattern| {
                let pattern = pattern.replace("{subject}", subject.id());
                glob_match(&pattern, scope.resource_name())
            })
    }

    fn allows(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == "*" || a == action)
    }
}

/// Rule based authorizer configured inline.
///
/// The actions granted on a scope are the requested actions allowed by at
/// least one matching rule.
pub struct StaticAuthorizer {
    rules: Vec<Rule>,
}

impl StaticAuthorizer {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    fn authorize_scope(&self, subject: &Subject, scope: &Scope) -> Option<Scope> {
        let matching: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|rule| rule.matches_subject(subject) && rule.matches_resource(subject, scope))
            .collect();

        scope.narrow(|action| matching.iter().any(|rule| rule.allows(action)))
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, subject: &Subject, requested: &[Scope]) -> Result<Vec<Scope>, AuthError> {
        Ok(requested
            .iter()
            .filter_map(|scope| self.authorize_scope(subject, scope))
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticAuthorizerConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl ComponentFactory<dyn Authorizer> for StaticAuthorizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (i, rule) in self.rules.iter().enumerate() {
            let invalid = |message: &str| {
                ConfigError::invalid_component("static authorizer", format!("rules[{i}]: {message}"))
            };

            if rule.names.is_empty() {
                return Err(invalid("at least one name pattern is required"));
            }
            if rule.names.iter().any(String::is_empty) {
                return Err(invalid("name patterns must not be empty"));
            }
            if rule.actions.is_empty() {
                return Err(invalid("at least one action is required"));
            }
            if rule.resource_type.is_empty() {
                return Err(invalid("resource type must not be empty"));
            }
            if rule.anonymous && (!rule.subjects.is_empty() || !rule.attributes.is_empty()) {
                return Err(invalid("anonymous rules cannot also match subjects or attributes"));
            }
        }

        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn Authorizer>, ConfigError> {
        Ok(Arc::new(StaticAuthorizer::new(self.rules.clone())))
    }
}

/// Matches a `/` separated resource name against a pattern.
fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let name: Vec<&str> = name.split('/').collect();
    match_segments(&pattern, &name)
}

fn match_segments(pattern: &[&str], name: &[&str]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&"**", rest)) => (0..=name.len()).any(|skip| match_segments(rest, &name[skip..])),
        Some((segment, rest)) => match name.split_first() {
            Some((first, remaining)) => match_segment(segment, first) && match_segments(rest, remaining),
            None => false,
        },
    }
}

fn match_segment(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, rest)) => {
            let Some(text) = text.strip_prefix(prefix) else {
                return false;
            };
            (0..=text.len())
                .filter(|&i| text.is_char_boundary(i))
                .any(|i| match_segment(rest, &text[i..]))
        }
    }
}
