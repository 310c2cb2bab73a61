//! Resource scopes in the registry token format.
//!
//! A scope is written `resourceType:resourceName:action[,action...]`, e.g.
//! `repository:library/alpine:pull,push`. The type ends at the first colon
//! and the actions start after the last one, so names that carry a registry
//! host with a port (`repository:localhost:5000/app:pull`) parse as expected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// A permission unit: a set of actions on one named resource.
///
/// Serializes to the `access` entry shape used in registry tokens:
/// `{"type": "...", "name": "...", "actions": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(rename = "name")]
    resource_name: String,
    actions: Vec<String>,
}

impl Scope {
    /// Builds a scope, dropping duplicate and empty actions while keeping the
    /// first-seen order.
    pub fn new<I, A>(resource_type: impl Into<String>, resource_name: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let mut scope = Self {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            actions: Vec::new(),
        };
        scope.extend_actions(actions);
        scope
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }

    /// Whether `other` names the same resource.
    pub fn same_resource(&self, other: &Scope) -> bool {
        self.resource_type == other.resource_type && self.resource_name == other.resource_name
    }

    /// Whether every action of `other` is present here, on the same resource.
    pub fn covers(&self, other: &Scope) -> bool {
        self.same_resource(other) && other.actions.iter().all(|a| self.has_action(a))
    }

    /// Keeps the actions accepted by `allowed`.
    ///
    /// Returns `None` when no action survives, so callers drop the scope
    /// entirely instead of granting an empty one.
    pub fn narrow(&self, mut allowed: impl FnMut(&str) -> bool) -> Option<Scope> {
        let actions: Vec<String> = self
            .actions
            .iter()
            .filter(|a| allowed(a))
            .cloned()
            .collect();

        if actions.is_empty() {
            return None;
        }

        Some(Scope {
            resource_type: self.resource_type.clone(),
            resource_name: self.resource_name.clone(),
            actions,
        })
    }

    fn extend_actions<I, A>(&mut self, actions: I)
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        for action in actions {
            let action = action.into();
            if !action.is_empty() && !self.has_action(&action) {
                self.actions.push(action);
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            self.actions.join(",")
        )
    }
}

impl FromStr for Scope {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AuthError::invalid_request(format!("invalid scope {s:?}"));

        let (resource_type, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (resource_name, actions) = rest.rsplit_once(':').ok_or_else(invalid)?;

        if resource_type.is_empty() || resource_name.is_empty() {
            return Err(invalid());
        }

        Ok(Scope::new(
            resource_type,
            resource_name,
            actions.split(',').map(str::trim),
        ))
    }
}

/// Parses scope parameter values.
///
/// Each value may hold several space separated scopes. Scopes naming the
/// same resource are merged, keeping the order of first appearance.
pub fn parse_scopes<'a, I>(values: I) -> Result<Vec<Scope>, AuthError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scopes: Vec<Scope> = Vec::new();

    for raw in values.into_iter().flat_map(str::split_whitespace) {
        let scope: Scope = raw.parse()?;
        match scopes.iter_mut().find(|s| s.same_resource(&scope)) {
            Some(existing) => existing.extend_actions(scope.actions),
            None => scopes.push(scope),
        }
    }

    Ok(scopes)
}

/// Renders scopes the way the OAuth2 `scope` response field expects them.
pub fn join_scopes(scopes: &[Scope]) -> String {
    scopes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether every granted scope is covered by some requested scope.
pub fn is_subset(granted: &[Scope], requested: &[Scope]) -> bool {
    granted
        .iter()
        .all(|g| requested.iter().any(|r| r.covers(g)))
}
