//! Client identity used to authenticate with the broker

use serde::{Deserialize, Serialize};

/// Default hardware identifier used when no provider is configured
pub const DEFAULT_MAC: &str = "00:0C:29:DE:AD:BE";

/// Immutable hardware identifier (a MAC address in practice)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the client's stable hardware identifier
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Identity provider returning a fixed, preconfigured identifier
#[derive(Debug, Clone)]
pub struct StaticIdentity(Identity);

impl StaticIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Identity::new(id))
    }
}

impl Default for StaticIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_MAC)
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}
