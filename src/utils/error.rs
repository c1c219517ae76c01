//! Error types for the messaging layer.
//!
//! Errors fall into three groups:
//! - argument errors (`EmptyTopic`, `EmptyId`), detected before any I/O
//! - in-state errors (`AlreadySubscribed`, `NotSubscribed`), which are
//!   idempotency signals left to the caller
//! - transport errors raised by a backend driver, wrapped as
//!   `PubSubError::Driver`
//!
//! `CodecError`, `AuthError` and `PersistenceError` belong to the CoAP
//! adapter and its collaborators.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("empty topic")]
    EmptyTopic,
    #[error("empty ID")]
    EmptyId,
    #[error("already subscribed to topic")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid broker URL `{0}`")]
    InvalidUrl(String),
    #[error("unsupported broker scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("failed to publish to `{topic}`: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to subscribe to `{topic}`: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to unsubscribe: {0}")]
    Unsubscribe(String),
    #[error("unknown subscription handle {0}")]
    UnknownSubscription(u64),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram shorter than the 4-byte header")]
    TooShort,
    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    #[error("malformed option")]
    InvalidOption,
    #[error("payload marker without payload")]
    EmptyPayload,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("access to channel `{0}` denied")]
    Forbidden(String),
    #[error("failed to sign credential: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
