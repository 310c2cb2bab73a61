//! Authenticated identities.

use std::collections::BTreeMap;

/// An authenticated identity plus the attributes authorization policy may
/// look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    id: String,
    enabled: bool,
    attributes: BTreeMap<String, String>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            attributes: BTreeMap::new(),
        }
    }

    /// The subject used for requests that carry no credentials.
    pub fn anonymous() -> Self {
        Self::new("")
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_empty()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}
