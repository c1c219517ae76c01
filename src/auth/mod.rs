//! Device authorization
//!
//! The CoAP adapter resolves every request's credential into a publisher
//! identity through an `Authorizer`. Two implementations ship with the crate:
//! - `JwtAuthorizer`: HS256 tokens naming the publisher and its channels
//! - `StaticAuthorizer`: a fixed credential table, mostly for tests and demos

pub mod jwt;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::utils::error::AuthError;

pub use jwt::{Claims, JwtAuthorizer};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Check that `credential` may use `channel`, returning the publisher
    /// identity it belongs to.
    async fn can_access(&self, credential: &str, channel: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone)]
struct Grant {
    publisher: String,
    channels: HashSet<String>,
}

/// Credential table held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, Grant>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `credential`, acting as `publisher`, on every channel in
    /// `channels`.
    pub fn grant<I, S>(mut self, credential: &str, publisher: &str, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants.insert(
            credential.to_string(),
            Grant {
                publisher: publisher.to_string(),
                channels: channels.into_iter().map(Into::into).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn can_access(&self, credential: &str, channel: &str) -> Result<String, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let grant = self
            .grants
            .get(credential)
            .ok_or(AuthError::InvalidCredential)?;
        if !grant.channels.contains(channel) {
            return Err(AuthError::Forbidden(channel.to_string()));
        }
        Ok(grant.publisher.clone())
    }
}
