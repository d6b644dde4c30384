//! On-disk store for the daemon's named state records.
//!
//! Each record is one JSON document in either the durable state directory
//! (survives reboot, e.g. `/var/lib/storaged/mounted-fs`) or the runtime
//! state directory (survives only a daemon restart, e.g.
//! `/run/storaged/unlocked-luks`). Writes are atomic: the new contents are
//! written to a temporary file and renamed over the record.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Which state directory a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    /// Survives OS reboots.
    Durable,
    /// Survives daemon restarts only.
    Volatile,
}

/// Named record storage with durable and volatile scopes.
#[derive(Debug)]
pub struct PersistentStore {
    durable_dir: PathBuf,
    volatile_dir: PathBuf,
}

impl PersistentStore {
    /// Creates a store rooted at the two state directories, creating them if
    /// necessary.
    pub fn new(durable_dir: &Path, volatile_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(durable_dir)?;
        std::fs::create_dir_all(volatile_dir)?;
        Ok(Self {
            durable_dir: durable_dir.to_path_buf(),
            volatile_dir: volatile_dir.to_path_buf(),
        })
    }

    fn record_path(&self, scope: StoreScope, name: &str) -> PathBuf {
        match scope {
            StoreScope::Durable => self.durable_dir.join(name),
            StoreScope::Volatile => self.volatile_dir.join(name),
        }
    }

    /// Reads the record `name`, or `None` if it has never been written.
    pub fn get<T: DeserializeOwned>(&self, scope: StoreScope, name: &str) -> Result<Option<T>> {
        let path = self.record_path(scope, name);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::Failed(format!(
                    "Error reading {}: {}",
                    path.display(),
                    err
                )));
            }
        };
        let value = serde_json::from_slice(&contents).map_err(|err| {
            Error::Failed(format!("Error parsing {}: {}", path.display(), err))
        })?;
        Ok(Some(value))
    }

    /// Replaces the record `name` atomically.
    pub fn set<T: Serialize>(&self, scope: StoreScope, name: &str, value: &T) -> Result<()> {
        let path = self.record_path(scope, name);
        let tmp_path = path.with_extension("tmp");
        let contents = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp_path, &contents).map_err(|err| {
            Error::Failed(format!("Error writing {}: {}", tmp_path.display(), err))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|err| {
            Error::Failed(format!("Error renaming {}: {}", tmp_path.display(), err))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn store() -> (tempfile::TempDir, PersistentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PersistentStore::new(&dir.path().join("lib"), &dir.path().join("run")).unwrap();
        (dir, store)
    }

    #[test]
    fn get_of_missing_record_is_none() {
        let (_dir, store) = store();
        let value: Option<BTreeMap<String, u64>> =
            store.get(StoreScope::Durable, "mounted-fs").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, store) = store();
        let mut value = BTreeMap::new();
        value.insert("/media/disk".to_string(), 2049u64);
        store.set(StoreScope::Durable, "mounted-fs", &value).unwrap();

        let read: BTreeMap<String, u64> = store
            .get(StoreScope::Durable, "mounted-fs")
            .unwrap()
            .unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn scopes_use_separate_directories() {
        let (dir, store) = store();
        store
            .set(StoreScope::Volatile, "loop", &BTreeMap::<String, u64>::new())
            .unwrap();
        assert!(dir.path().join("run/loop").exists());
        assert!(!dir.path().join("lib/loop").exists());
    }

    #[test]
    fn serialization_is_stable_across_round_trips() {
        let (dir, store) = store();
        let mut value = BTreeMap::new();
        value.insert("/media/b".to_string(), 2050u64);
        value.insert("/media/a".to_string(), 2049u64);
        store.set(StoreScope::Durable, "mounted-fs", &value).unwrap();
        let first = std::fs::read(dir.path().join("lib/mounted-fs")).unwrap();

        let read: BTreeMap<String, u64> = store
            .get(StoreScope::Durable, "mounted-fs")
            .unwrap()
            .unwrap();
        store.set(StoreScope::Durable, "mounted-fs", &read).unwrap();
        let second = std::fs::read(dir.path().join("lib/mounted-fs")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("lib/mounted-fs"), b"not json").unwrap();
        let value: Result<Option<BTreeMap<String, u64>>> =
            store.get(StoreScope::Durable, "mounted-fs");
        assert!(value.is_err());
    }
}
