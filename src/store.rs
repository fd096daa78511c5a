//! String-keyed persistence with change notification.
//!
//! Backends implement [`KeyValueStore`]. [`ObservableStore`] wraps a backend,
//! remembers the last value it saw for each key and notifies subscribers when
//! a value changes, whether the write came through the wrapper or from
//! another process touching the same backend (see
//! [`ObservableStore::sync_external`]).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const FILE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode value for key {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value for key {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
}

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.values.keys().cloned().collect())
    }
}

/// One `<key>.json` file per key inside a data directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.{FILE_EXTENSION}")))
    }
}

impl KeyValueStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let staging = path.with_extension("tmp");
        fs::write(&staging, value).map_err(|source| StorageError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| StorageError::Io { path, source })
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    key: String,
    callback: Box<dyn FnMut(&str)>,
}

pub struct ObservableStore<S: KeyValueStore> {
    backend: S,
    last_seen: HashMap<String, Option<String>>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl<S: KeyValueStore> ObservableStore<S> {
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            last_seen: HashMap::new(),
            subscribers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// `callback` receives only the key that changed and must re-read it.
    pub fn subscribe(
        &mut self,
        key: impl Into<String>,
        callback: impl FnMut(&str) + 'static,
    ) -> Result<SubscriptionId, StorageError> {
        let key = key.into();
        if !self.last_seen.contains_key(&key) {
            let current = self.backend.get(&key)?;
            self.last_seen.insert(key.clone(), current);
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            key,
            callback: Box::new(callback),
        });
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|subscriber| subscriber.id != id);
        before != self.subscribers.len()
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.backend.get(key)
    }

    pub fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.backend.set(key, value)?;
        self.observe(key, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.backend.remove(key)?;
        self.observe(key, None);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(key)? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Decode {
                    key: key.to_string(),
                    source,
                }),
            _ => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, &raw)
    }

    /// Re-reads every watched key from the backend and notifies for values
    /// changed by someone else. Returns the keys that changed.
    pub fn sync_external(&mut self) -> Result<Vec<String>, StorageError> {
        let watched = self.last_seen.keys().cloned().collect::<Vec<_>>();
        let mut changed = Vec::new();
        for key in watched {
            let current = self.backend.get(&key)?;
            if self.observe(&key, current) {
                changed.push(key);
            }
        }
        Ok(changed)
    }

    fn observe(&mut self, key: &str, value: Option<String>) -> bool {
        let previous = self.last_seen.insert(key.to_string(), value.clone());
        let changed = match previous {
            Some(previous) => previous != value,
            None => true,
        };
        if changed {
            self.notify(key);
        }
        changed
    }

    fn notify(&mut self, key: &str) {
        let mut delivered = 0;
        for subscriber in self
            .subscribers
            .iter_mut()
            .filter(|subscriber| subscriber.key == key)
        {
            (subscriber.callback)(key);
            delivered += 1;
        }
        debug!("store key {key:?} changed; notified {delivered} subscriber(s)");
    }
}
