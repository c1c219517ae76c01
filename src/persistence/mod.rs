//! The `persistence` module stores route mappings: a small durable key/value
//! space used by adapters to map external identifiers onto channels.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

use crate::utils::error::PersistenceError;

pub use sled_store::{SledRouteMap, StoredRoute};

/// Key/value route lookup.
pub trait RouteMap: Send + Sync {
    /// Insert or replace the value stored under `key`.
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}
