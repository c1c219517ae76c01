//! Route map backed by `sled`
//!
//! Every route lives in one sled tree as a JSON record holding the value and
//! the time it was saved (milliseconds since the UNIX epoch).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::persistence::RouteMap;
use crate::utils::error::PersistenceError;

const DEFAULT_TREE: &str = "routes";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredRoute {
    pub value: String,
    pub saved_at: i64,
}

#[derive(Clone)]
pub struct SledRouteMap {
    db: Db,
    tree: Tree,
}

impl SledRouteMap {
    /// Open or create a sled database at `path`, using the default tree.
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        Self::with_tree(sled::open(path)?, DEFAULT_TREE)
    }

    /// Keep routes in tree `name` of an already open database, so several
    /// maps can share one database.
    pub fn with_tree(db: Db, name: &str) -> Result<Self, PersistenceError> {
        let tree = db.open_tree(name)?;
        Ok(Self { db, tree })
    }

    /// Full record stored under `key`.
    pub fn record(&self, key: &str) -> Result<Option<StoredRoute>, PersistenceError> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Block until every write reached disk.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

impl RouteMap for SledRouteMap {
    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let record = StoredRoute {
            value: value.to_string(),
            saved_at: Utc::now().timestamp_millis(),
        };
        self.tree
            .insert(key.as_bytes(), serde_json::to_vec(&record)?)?;
        debug!(key = %key, "route saved");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.record(key)?.map(|r| r.value))
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for SledRouteMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledRouteMap")
            .field("db", &"sled::Db")
            .field("routes", &self.tree.len())
            .finish()
    }
}
