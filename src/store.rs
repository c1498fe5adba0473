use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::{restrict_file_permissions, unique_time_suffix};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage io error for {key}: {message}")]
    Io { key: String, message: String },

    #[error("serialization error for {key}: {message}")]
    Serialization { key: String, message: String },
}

/// Process-wide persisted key-value state.
///
/// Keys are namespaced (`powermon.api_url`, `powermon.notifications.v1`, ...)
/// and values are text; structured values are stored as JSON.
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` when the key has never been written.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|error| StoreError::Serialization {
            key: key.to_string(),
            message: error.to_string(),
        })
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let content = serde_json::to_string(value).map_err(|error| StoreError::Serialization {
        key: key.to_string(),
        message: error.to_string(),
    })?;
    store.set(key, &content)
}

/// In-memory store used by tests and by callers that want no persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()?.remove(key);
        Ok(())
    }
}

/// One file per key under a data directory, written atomically
/// (temp file + rename) with owner-only permissions.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|error| StoreError::Io {
            key: dir.to_string_lossy().to_string(),
            message: format!("failed to create data directory: {error}"),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|error| StoreError::Io {
                key: key.to_string(),
                message: format!("failed to read: {error}"),
            })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension(format!("tmp-{}", unique_time_suffix()));
        fs::write(&tmp_path, value).map_err(|error| StoreError::Io {
            key: key.to_string(),
            message: format!("failed to write temp file: {error}"),
        })?;
        restrict_file_permissions(&tmp_path);
        fs::rename(&tmp_path, &path).map_err(|error| StoreError::Io {
            key: key.to_string(),
            message: format!("failed to atomically replace: {error}"),
        })?;
        debug!(key, bytes = value.len(), "store: wrote key");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::Io {
                key: key.to_string(),
                message: format!("failed to delete: {error}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn memory_store_can_be_switched_off() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store.set_unavailable(true);
        assert!(matches!(store.get("a"), Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("powermon.api_url", "https://example.test").unwrap();
        }
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("powermon.api_url").unwrap().as_deref(),
            Some("https://example.test")
        );
        reopened.delete("powermon.api_url").unwrap();
        assert_eq!(reopened.get("powermon.api_url").unwrap(), None);
    }

    #[test]
    fn file_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[test]
    fn json_helpers_round_trip_and_report_corruption() {
        let store = MemoryStore::new();
        write_json(&store, "list", &vec!["A", "B"]).unwrap();
        let back: Option<Vec<String>> = read_json(&store, "list").unwrap();
        assert_eq!(back, Some(vec!["A".to_string(), "B".to_string()]));

        store.set("list", "{not json").unwrap();
        let err = read_json::<Vec<String>>(&store, "list").unwrap_err();
        assert!(matches!(err, StoreError::Serialization { .. }));
    }
}
