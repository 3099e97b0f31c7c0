//! Small persisted key/value store for per-user settings.
//!
//! Values live in one JSON object per domain, by default at
//! `$XDG_CONFIG_HOME/scriptrun/<domain>.json`. Every setter writes the file
//! back immediately. Opening a domain refuses to run as root so that a
//! `sudo` invocation never leaves root-owned files in a user's config dir.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, getuid};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::console::{self, Message};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("cannot run as root user")]
    InvalidUser,
}

#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("preferences I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid preferences JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fail with [`AccessError::InvalidUser`] when `uid` is root.
pub fn ensure_not_root(uid: Uid) -> Result<(), AccessError> {
    if uid.is_root() {
        return Err(AccessError::InvalidUser);
    }
    Ok(())
}

/// Refuse to continue as root, telling the user why.
pub fn assert_not_root() -> Result<(), AccessError> {
    ensure_not_root(getuid()).inspect_err(|_| {
        console::log(&[Message::plain("Error: Cannot run as root user")]);
    })
}

pub fn default_preferences_path(domain: &str) -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("scriptrun").join(format!("{domain}.json"))
}

#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl Preferences {
    /// Open the store for `domain` in the user's config directory.
    pub fn open(domain: &str) -> Result<Self, PreferencesError> {
        assert_not_root()?;
        Self::at_path(default_preferences_path(domain))
    }

    /// Open the store backed by `path`. A missing file is an empty store.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self, PreferencesError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| PreferencesError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "no preferences file yet");
                BTreeMap::new()
            }
            Err(source) => return Err(PreferencesError::Io { path, source }),
        };
        debug!(path = %path.display(), keys = values.len(), "loaded preferences");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// A list of strings; `None` if the key is missing or holds anything else.
    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        self.get(key)
    }

    /// Deserialize the value at `key`, or `None` if it is missing or has a
    /// different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                debug!(key, error = %err, "preference has unexpected type");
                None
            }
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PreferencesError> {
        self.set(key, &value)
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> Result<(), PreferencesError> {
        self.set(key, &value)
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<(), PreferencesError> {
        self.set(key, value)
    }

    pub fn set_strings(&mut self, key: &str, value: &[String]) -> Result<(), PreferencesError> {
        self.set(key, value)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), PreferencesError> {
        let value = serde_json::to_value(value).map_err(|source| self.json_error(source))?;
        self.values.insert(key.to_string(), value);
        self.save()
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> Result<bool, PreferencesError> {
        if self.values.remove(key).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn json_error(&self, source: serde_json::Error) -> PreferencesError {
        PreferencesError::Json {
            path: self.path.clone(),
            source,
        }
    }

    fn io_error(&self, source: io::Error) -> PreferencesError {
        PreferencesError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Write through a temp file and rename, so a crash never leaves a
    /// half-written store behind.
    fn save(&self) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let data = serde_json::to_vec_pretty(&self.values).map_err(|source| self.json_error(source))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;
        trace!(path = %self.path.display(), "saved preferences");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Preferences {
        Preferences::at_path(dir.path().join("nested").join("prefs.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let prefs = store(&dir);
        assert!(!prefs.contains("anything"));
        assert_eq!(prefs.get_bool("anything"), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let mut prefs = store(&dir);
        prefs.set_bool("stream", true).unwrap();
        prefs.set_int("runs", 42).unwrap();
        prefs.set_string("lastCommand", "make test").unwrap();
        prefs
            .set_strings("history", &["ls".to_string(), "make".to_string()])
            .unwrap();

        let reopened = Preferences::at_path(prefs.path()).unwrap();
        assert_eq!(reopened.get_bool("stream"), Some(true));
        assert_eq!(reopened.get_int("runs"), Some(42));
        assert_eq!(reopened.get_string("lastCommand"), Some("make test"));
        assert_eq!(
            reopened.get_strings("history"),
            Some(vec!["ls".to_string(), "make".to_string()])
        );
    }

    #[test]
    fn test_mismatched_type_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let mut prefs = store(&dir);
        prefs.set_string("runs", "many").unwrap();
        assert_eq!(prefs.get_int("runs"), None);
        assert_eq!(prefs.get_strings("runs"), None);
    }

    #[test]
    fn test_remove_persists() {
        let dir = TempDir::new().unwrap();
        let mut prefs = store(&dir);
        prefs.set_int("runs", 1).unwrap();
        assert!(prefs.remove("runs").unwrap());
        assert!(!prefs.remove("runs").unwrap());

        let reopened = Preferences::at_path(prefs.path()).unwrap();
        assert!(!reopened.contains("runs"));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "{not json").unwrap();
        let err = Preferences::at_path(&path).unwrap_err();
        assert!(matches!(err, PreferencesError::Json { .. }));
    }

    #[test]
    fn test_root_is_rejected() {
        assert_eq!(
            ensure_not_root(Uid::from_raw(0)),
            Err(AccessError::InvalidUser)
        );
        assert_eq!(ensure_not_root(Uid::from_raw(1000)), Ok(()));
    }

    #[test]
    fn test_default_path_is_per_domain() {
        let path = default_preferences_path("history");
        assert!(path.ends_with("scriptrun/history.json"));
    }
}
