//! The `utils` module provides shared definitions used across `chanbus`.
//!
//! It centralizes the error taxonomy of the messaging layer and the tracing
//! bootstrap used by the binary and by tests.

pub mod error;
pub mod logging;

pub use error::{
    AuthError, CodecError, DriverError, HandlerError, PersistenceError, PubSubError,
};

#[cfg(test)]
mod tests;
