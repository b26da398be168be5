//! A file-backed storage area

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use super::{Storage, StorageError};

/// A storage area that keeps one file per key inside a directory
///
/// Every key is replaced atomically by writing a sibling temporary file and
/// renaming it into place, so readers in other processes see either the old
/// or the new value of a key, never a torn one. Nothing spans several keys.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Constructs a new file storage rooted at `dir`
    ///
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the stored keys
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable storage key `{}`", key),
            )
            .into());
        }
        Ok(self.dir.join(key))
    }

    fn write_atomically(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let tmp = self.dir.join(format!(".{}.tmp", key));
        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            file_opts.mode(0o600);
        }

        let mut file = file_opts.open(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Ok(self.write_atomically(&path, key, value)?)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("session"));

        assert_eq!(storage.get_item("access_token").unwrap(), None);

        storage.set_item("access_token", "A1").unwrap();
        storage.set_item("access_token", "A2").unwrap();
        assert_eq!(
            storage.get_item("access_token").unwrap().as_deref(),
            Some("A2")
        );

        storage.remove_item("access_token").unwrap();
        storage.remove_item("access_token").unwrap();
        assert_eq!(storage.get_item("access_token").unwrap(), None);
    }

    #[test]
    fn two_handles_on_one_directory_observe_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileStorage::new(dir.path());
        let reader = FileStorage::new(dir.path());

        writer.set_item("username", "alice").unwrap();
        assert_eq!(reader.get_item("username").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn path_like_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        assert!(storage.set_item("../escape", "x").is_err());
        assert!(storage.get_item(".hidden").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set_item("refresh_token", "R1").unwrap();

        let mode = fs::metadata(dir.path().join("refresh_token"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
