//! Flat key/value storage surfaces for session credentials
//!
//! A [`Storage`] offers no transactions and no locking. Each key is read and
//! written independently, and other processes may change the contents at any
//! time.

use std::error;

pub mod memory;
#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// A boxed error reported by a storage backend
pub type StorageError = Box<dyn error::Error + Send + Sync + 'static>;

/// A synchronous string key/value storage area
pub trait Storage: Send + Sync {
    /// Reads the value stored under `key`, if any
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`; removing an absent key is not an error
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}
