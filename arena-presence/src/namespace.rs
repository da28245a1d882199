//! Namespace scoping for keys and topics
//!
//! Every key and topic handed to a presence backend passes through a
//! `Namespace` first. Two instances with different prefixes sharing one Redis
//! never see each other's state. The isolation is logical only: both still
//! talk to the same server.

/// Construction-time prefix prepended to every key and topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Create a new `Namespace` with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Namespace used by a tenant's presence caches
    ///
    /// Deployments keyed by an API key share one Redis; each tenant gets
    /// `<api_key>_presencecaches` in front of everything it stores.
    #[must_use]
    pub fn for_tenant(api_key: &str) -> Self {
        Self::new(format!("{api_key}_presencecaches"))
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Scope a key or topic
    #[must_use]
    pub fn scope(&self, name: &str) -> String {
        let mut scoped = String::with_capacity(self.prefix.len() + name.len());
        scoped.push_str(&self.prefix);
        scoped.push_str(name);
        scoped
    }

    /// Scope several keys at once (`SINTER` and friends)
    #[must_use]
    pub fn scope_all(&self, names: &[&str]) -> Vec<String> {
        names.iter().map(|name| self.scope(name)).collect()
    }
}
