//! An in-memory storage area

use std::{
    collections::HashMap,
    io,
    sync::{Arc, RwLock},
};

use super::{Storage, StorageError};

/// An in-memory storage area
///
/// Clones share the same underlying map, which makes it possible to model
/// several independent sessions observing one storage area.
#[derive(Clone, Default, Debug)]
pub struct MemoryStorage {
    items: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Constructs a new, empty storage area
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StorageError {
    io::Error::new(io::ErrorKind::Other, "storage lock poisoned").into()
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.remove(key);
        Ok(())
    }
}
