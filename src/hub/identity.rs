//! Credential to stable identity resolution.

use std::collections::HashMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::groups::normalize_token;

/// Stable user identity, independent of connection churn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserRsn(Uuid);

impl UserRsn {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserRsn {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserRsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("No identity is known for the user token")]
    UnknownToken,

    #[error("Identity lookup failed: {0}")]
    Lookup(String),
}

/// Converts a normalized user token into a stable identity.
///
/// Implementations may fail at any time; the relay treats every failure as
/// non-fatal.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, user_token: &str) -> Result<UserRsn, IdentityError>;
}

impl<F> IdentityResolver for F
where
    F: Fn(&str) -> Result<UserRsn, IdentityError> + Send + Sync,
{
    fn resolve(&self, user_token: &str) -> Result<UserRsn, IdentityError> {
        self(user_token)
    }
}

/// Resolver backed by a fixed token table, loaded from configuration
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    mappings: DashMap<String, UserRsn>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mappings(mappings: &HashMap<String, Uuid>) -> Self {
        let resolver = Self::new();
        for (token, id) in mappings {
            resolver.insert(token, UserRsn::new(*id));
        }
        resolver
    }

    /// Map `user_token` (normalized on insert) to `user_rsn`
    pub fn insert(&self, user_token: &str, user_rsn: UserRsn) {
        self.mappings.insert(normalize_token(user_token), user_rsn);
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, user_token: &str) -> Result<UserRsn, IdentityError> {
        self.mappings
            .get(user_token)
            .map(|entry| *entry.value())
            .ok_or(IdentityError::UnknownToken)
    }
}
