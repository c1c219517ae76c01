use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::auth::Authorizer;
use crate::utils::error::AuthError;

/// Token claims: `sub` is the publisher, `channels` the channels it may use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub channels: Vec<String>,
    pub exp: usize,
}

pub struct JwtAuthorizer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthorizer").finish_non_exhaustive()
    }
}

impl JwtAuthorizer {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            validation: Validation::default(),
        }
    }

    /// Mint a credential for `publisher` valid on `channels` for `ttl`.
    pub fn issue(
        &self,
        publisher: &str,
        channels: &[String],
        ttl: chrono::Duration,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: publisher.to_string(),
            channels: channels.to_vec(),
            exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn verify(&self, credential: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(credential, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::InvalidCredential)
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn can_access(&self, credential: &str, channel: &str) -> Result<String, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let claims = self.verify(credential)?;
        if !claims.channels.iter().any(|c| c == channel) {
            return Err(AuthError::Forbidden(channel.to_string()));
        }
        Ok(claims.sub)
    }
}
