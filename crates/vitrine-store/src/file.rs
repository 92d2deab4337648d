//! Filesystem key/value backend.
//!
//! The simple fallback tier: one JSON file per key under a base directory.
//! Writes are atomic (temp file + rename). Out-of-space failures surface as
//! [`Error::QuotaExceeded`].

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use vitrine_core::{Error, KeyValueBackend, Result};

const FILE_EXTENSION: &str = "kv";

/// Directory-backed key/value store.
pub struct FileBackend {
    base_path: PathBuf,
}

impl FileBackend {
    /// Create a new filesystem backend rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Create the directory and verify it supports write, read and delete.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let backend = Self::new(base_path);
        backend.validate().await.map_err(Error::Storage)?;
        Ok(backend)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.base_path.join(format!("{}.{}", encoded, FILE_EXTENSION))
    }

    fn decode_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(&format!(".{}", FILE_EXTENSION))?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Round-trip a scratch file so filesystem problems show up at startup.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let check_file = self.base_path.join(".health-check.tmp");

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", self.base_path, e))?;

        let data = b"kv-health-check";
        fs::write(&check_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", check_file, e))?;

        let read_back = fs::read(&check_file)
            .await
            .map_err(|e| format!("read({:?}): {}", check_file, e))?;
        if read_back != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&check_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", check_file, e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.file_path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from_io(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let full_path = self.file_path(key);
        debug!(backend = "file", key, size_bytes = value.len(), "kv: set");

        fs::create_dir_all(&self.base_path).await.map_err(Error::from_io)?;

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(Error::from_io)?;
        if let Err(e) = file.write_all(value.as_bytes()).await {
            warn!(temp_path = %temp_path.display(), error = %e, "kv: write_all failed");
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::from_io(e));
        }
        file.sync_all().await.map_err(Error::from_io)?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "kv: rename failed");
            Error::from_io(e)
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from_io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(Self::decode_file_name)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_idempotent_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("kv")).await.unwrap();

        backend.set("library:alice", "{\"a\":1}").await.unwrap();
        assert_eq!(
            backend.get("library:alice").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        backend.delete("library:alice").await.unwrap();
        backend.delete("library:alice").await.unwrap();
        assert!(backend.get("library:alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_decode_separators() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.set("vitrine/library:bob", "1").await.unwrap();
        backend.set("vitrine/__marker", "2").await.unwrap();

        let keys = backend.keys().await.unwrap();
        assert_eq!(keys, vec!["vitrine/__marker", "vitrine/library:bob"]);
    }

    #[tokio::test]
    async fn test_keys_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("never-created"));
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.set("k", "v").await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".kv"));
    }
}
