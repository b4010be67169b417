//! Durable local key/value storage.
//!
//! A flat string-to-string map that survives restarts, shared by the token
//! store and the identity provider client. Keys are namespaced by prefix
//! (`dashlink.` for application keys, `oidc.` for provider internals).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage IO error on {key}: {message}")]
    Io { key: String, message: String },
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// Persistent key/value slot storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removing an absent key succeeds.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-process storage; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under a base directory.
///
/// Writes go through a temp file and rename so a crash never leaves a
/// half-written value behind. On unix, files are created `0600`.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    base_dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.base_dir.join(encode_key(key)?))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(key, err)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        atomic_write(&path, value.as_bytes()).map_err(|err| io_error(key, err))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(key, err)),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(prefix, err)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(prefix, err))?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(decode_key) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn io_error(key: &str, err: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        message: err.to_string(),
    }
}

// Keys may contain ':' and '/', so file names are percent-encoded.
const KEY_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

fn encode_key(key: &str) -> Result<String, StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".into()));
    }
    let encoded = utf8_percent_encode(key, KEY_ESCAPES).to_string();
    // A leading dot would make the file hidden and collide with temp files.
    let encoded = match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded,
    };
    Ok(format!("{encoded}.kv"))
}

fn decode_key(file_name: &str) -> Option<String> {
    let encoded = file_name.strip_suffix(".kv")?;
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|key| key.into_owned())
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_path = path.with_file_name(format!(
        ".{file_name}.tmp-{}-{nonce}",
        std::process::id()
    ));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let write_result = (|| -> std::io::Result<()> {
        let mut temp_file = options.open(&temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_round_trips_namespaced_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path());
        store
            .set("oidc.user:https://id.example:dashboard", "{}")
            .unwrap();
        assert_eq!(
            store
                .get("oidc.user:https://id.example:dashboard")
                .unwrap()
                .as_deref(),
            Some("{}")
        );
        assert_eq!(
            store.keys_with_prefix("oidc.user:").unwrap(),
            vec!["oidc.user:https://id.example:dashboard".to_string()]
        );
    }

    #[test]
    fn file_store_remove_missing_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path().join("nested"));
        store.remove("dashlink.access_token").unwrap();
        assert!(store.keys_with_prefix("").unwrap().is_empty());
    }

    #[test]
    fn file_store_overwrites_value() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path());
        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
    }

    #[cfg(unix)]
    #[test]
    fn file_store_restricts_permissions() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path());
        store.set("secret", "value").unwrap();
        let path = store.path_for("secret").unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn empty_key_is_rejected() {
        let store = FileKeyValueStore::new("/tmp/unused");
        assert!(matches!(store.get(""), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn key_encoding_is_reversible() {
        for key in [
            "dashlink.access_token",
            "oidc.pending:abc",
            ".hidden",
            "a/b c",
            "oidc.user:https://id.example/realm:dash%board",
            "ünïcode",
        ] {
            let encoded = encode_key(key).unwrap();
            assert!(!encoded.starts_with('.'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn key_encoding_escapes_path_separators() {
        assert_eq!(encode_key("oidc.pending:a/b").unwrap(), "oidc.pending%3Aa%2Fb.kv");
        assert_eq!(encode_key(".x").unwrap(), "%2Ex.kv");
        assert!(decode_key("stray.tmp").is_none());
    }

    #[test]
    fn memory_store_filters_by_prefix() {
        let store = MemoryKeyValueStore::new();
        store.set("oidc.pending:1", "a").unwrap();
        store.set("oidc.user:x", "b").unwrap();
        store.set("dashlink.access_token", "c").unwrap();
        assert_eq!(
            store.keys_with_prefix("oidc.").unwrap(),
            vec!["oidc.pending:1".to_string(), "oidc.user:x".to_string()]
        );
        store.remove("oidc.user:x").unwrap();
        store.remove("oidc.user:x").unwrap();
        assert!(store.get("oidc.user:x").unwrap().is_none());
    }
}
