//! Checkpoint ledger persistence.
//!
//! The ledger is a flat key/value document holding step-completion flags and
//! the secrets later steps depend on. It is read once at process start and
//! written back after every mutation, so an interrupted run resumes at the
//! first step whose flag was never persisted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by ledger reads, writes and lookups.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The ledger file exists but could not be read.
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The ledger file is not a flat key/value document.
    #[error("failed to parse ledger {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The ledger could not be written back to disk.
    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The in-memory ledger could not be serialized.
    #[error("failed to encode ledger: {0}")]
    Encode(#[from] serde_json::Error),

    /// A required key has never been produced by an earlier step.
    #[error("required ledger key '{key}' is missing")]
    Missing { key: String },
}

/// A scalar stored under a dotted checkpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LedgerValue {
    /// Step-completion flag.
    Bool(bool),
    /// Numeric identifier.
    Int(i64),
    /// Derived secret or identifier.
    Text(String),
}

impl std::fmt::Display for LedgerValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for LedgerValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for LedgerValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for LedgerValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for LedgerValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Persisted step-completion ledger.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    /// Backing file. `None` keeps the ledger in memory only.
    path: Option<PathBuf>,
    entries: BTreeMap<String, LedgerValue>,
}

impl Ledger {
    /// Load the ledger stored at `path`.
    ///
    /// A missing file yields an empty ledger bound to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "No ledger on disk, starting empty");
            return Ok(Self {
                path: Some(path),
                entries: BTreeMap::new(),
            });
        }

        let content = fs::read_to_string(&path).map_err(|source| LedgerError::Read {
            path: path.clone(),
            source,
        })?;
        let entries = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&content).map_err(|source| LedgerError::Parse {
                path: path.clone(),
                source,
            })?
        };

        info!(
            path = %path.display(),
            entries = entries.len(),
            "Loaded checkpoint ledger"
        );
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// A ledger that never touches the disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&LedgerValue> {
        self.entries.get(key)
    }

    /// Whether `key` holds `true`. Any other value, or absence, is `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(LedgerValue::Bool(true)))
    }

    /// Text stored under `key`. Empty strings read as absent.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(LedgerValue::Text(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether `key` holds a usable value (a non-empty string or any non-string scalar).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(LedgerValue::Text(s)) => !s.is_empty(),
            Some(_) => true,
            None => false,
        }
    }

    /// Text stored under `key`, failing if it was never produced.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Missing`] if the key is absent or empty.
    pub fn require(&self, key: &str) -> Result<&str, LedgerError> {
        self.text(key).ok_or_else(|| LedgerError::Missing {
            key: key.to_string(),
        })
    }

    /// Set a value in memory. Call [`Ledger::persist`] to make it durable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<LedgerValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Remove a value from memory.
    pub fn remove(&mut self, key: &str) -> Option<LedgerValue> {
        self.entries.remove(key)
    }

    /// Iterate all entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &LedgerValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the whole document to disk.
    ///
    /// The document is written to a temporary sibling and renamed over the
    /// ledger so a crash never leaves a truncated file behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be encoded or written.
    pub fn persist(&self) -> Result<(), LedgerError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let body = serde_json::to_string_pretty(&self.entries)?;
        atomic_write(path, &body).map_err(|source| LedgerError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), entries = self.entries.len(), "Ledger persisted");
        Ok(())
    }

    /// Set `key` and persist immediately.
    ///
    /// If the write fails the previous in-memory value is restored, so the
    /// caller never observes a value the next run would not see.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn set_and_persist(
        &mut self,
        key: impl Into<String>,
        value: impl Into<LedgerValue>,
    ) -> Result<(), LedgerError> {
        let key = key.into();
        let previous = self.entries.insert(key.clone(), value.into());

        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.entries.insert(key, old),
                None => self.entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Mark a checkpoint flag complete and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails; the flag is then left unset.
    pub fn mark_complete(&mut self, key: &str) -> Result<(), LedgerError> {
        self.set_and_persist(key, true)
    }
}

fn atomic_write(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("ledger");
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flag_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut ledger = Ledger::load(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.set("x.y", true);
        ledger.persist().unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.get("x.y"), Some(&LedgerValue::Bool(true)));
        assert!(reloaded.flag("x.y"));
    }

    #[test]
    fn test_scalar_types_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut ledger = Ledger::load(&path).unwrap();
        ledger.set("gitlab.token", "abc123");
        ledger.set("gitlab.group.id", 42_i64);
        ledger.set("gitlab.keyuploaded", false);
        ledger.persist().unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.text("gitlab.token"), Some("abc123"));
        assert_eq!(reloaded.get("gitlab.group.id"), Some(&LedgerValue::Int(42)));
        assert!(!reloaded.flag("gitlab.keyuploaded"));
        assert!(reloaded.contains("gitlab.keyuploaded"));
    }

    #[test]
    fn test_empty_string_is_missing() {
        let mut ledger = Ledger::in_memory();
        ledger.set("vault.token", "");

        assert!(ledger.text("vault.token").is_none());
        assert!(!ledger.contains("vault.token"));
        let err = ledger.require("vault.token").unwrap_err();
        assert!(err.to_string().contains("vault.token"));
    }

    #[test]
    fn test_non_bool_value_is_not_a_flag() {
        let mut ledger = Ledger::in_memory();
        ledger.set("create.dns.zone", "true");
        assert!(!ledger.flag("create.dns.zone"));
    }

    #[test]
    fn test_failed_persist_rolls_back_value() {
        let dir = TempDir::new().unwrap();
        // A directory where the ledger file should be makes the rename fail.
        let path = dir.path().join("state.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let mut ledger = Ledger {
            path: Some(path),
            entries: BTreeMap::new(),
        };

        let result = ledger.mark_complete("create.gitlab.ready");
        assert!(result.is_err());
        assert!(!ledger.flag("create.gitlab.ready"));
        assert!(ledger.get("create.gitlab.ready").is_none());
    }

    #[test]
    fn test_failed_persist_restores_previous_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let mut ledger = Ledger {
            path: Some(path),
            entries: BTreeMap::new(),
        };
        ledger.set("gitlab.token", "old");

        assert!(ledger.set_and_persist("gitlab.token", "new").is_err());
        assert_eq!(ledger.text("gitlab.token"), Some("old"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "[1, 2, 3]").unwrap();

        let err = Ledger::load(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Parse { .. }));
    }

    #[test]
    fn test_in_memory_persist_is_noop() {
        let mut ledger = Ledger::in_memory();
        ledger.mark_complete("a.b").unwrap();
        assert!(ledger.flag("a.b"));
        assert!(ledger.path().is_none());
    }
}
