//! Storage adapter backed by `sled`.
//!
//! All entries live in one named tree so the queue state does not collide
//! with anything else sharing the database directory. Every write is
//! flushed before returning: the queue only persists on mutation and a
//! backlog that is lost on crash defeats the purpose.

use sled::{Db, Tree};

use super::storage::QueueStorage;
use crate::utils::{HubLinkError, Result};

const TREE_NAME: &str = "hublink_queue";

#[derive(Clone)]
pub struct SledStorage {
    db: Db,
    tree: Tree,
}

impl SledStorage {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl QueueStorage for SledStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| HubLinkError::Storage(format!("non-utf8 value under '{key}': {e}")))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStorage")
            .field("db", &"sled::Db")
            .field("was_recovered", &self.db.was_recovered())
            .finish()
    }
}
