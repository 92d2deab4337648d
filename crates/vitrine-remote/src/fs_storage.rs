//! Filesystem object storage for local and development deployments.
//!
//! Objects are content-addressed by BLAKE3 hash, so uploading the same bytes
//! twice yields the same key and a single file.
//! Key format: `objects/{first-2-hex}/{next-2-hex}/{hash}{.ext}`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use vitrine_core::logging::SUBSYSTEM_REMOTE;
use vitrine_core::{Error, ObjectStorage, Result, StoredObject};

/// Object storage rooted at a local directory. Auth tokens are ignored.
pub struct FilesystemObjectStorage {
    base_path: PathBuf,
    public_base_url: Option<String>,
}

/// Content-addressed object key for `data`, keeping the extension of `name`.
pub fn content_key(data: &[u8], name: &str) -> String {
    let hash = blake3::hash(data).to_hex();
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("objects/{}/{}/{}{}", &hash[0..2], &hash[2..4], hash, ext)
}

impl FilesystemObjectStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: None,
        }
    }

    /// Serve public URLs from this base instead of `file://` paths.
    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Resolve a key, rejecting anything that would escape the base directory.
    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !safe || key.is_empty() {
            return Err(Error::InvalidInput(format!("invalid object key: {:?}", key)));
        }
        Ok(self.base_path.join(relative))
    }

    /// Validate that the directory supports write, read and delete.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let check_dir = self.base_path.join("objects/.health-check");
        fs::create_dir_all(&check_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", check_dir, e))?;
        let file = check_dir.join("test.bin");
        let data = b"storage-health-check";
        fs::write(&file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", file, e))?;
        let read = fs::read(&file)
            .await
            .map_err(|e| format!("read({:?}): {}", file, e))?;
        if read != data {
            return Err("read-back mismatch".to_string());
        }
        fs::remove_file(&file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", file, e))?;
        let _ = fs::remove_dir(&check_dir).await;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for FilesystemObjectStorage {
    async fn upload(&self, bytes: &[u8], name: &str, _auth_token: &str) -> Result<StoredObject> {
        let key = content_key(bytes, name);
        let full_path = self.full_path(&key)?;
        let stored = StoredObject {
            key: key.clone(),
            size: bytes.len() as u64,
        };

        if fs::try_exists(&full_path).await.map_err(Error::from_io)? {
            debug!(subsystem = SUBSYSTEM_REMOTE, component = "fs_storage", object_key = %key, "Object already stored");
            return Ok(stored);
        }

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(Error::from_io)?;
        }

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(Error::from_io)?;
        if let Err(e) = file.write_all(bytes).await {
            warn!(temp_path = %temp_path.display(), error = %e, "fs_storage: write_all failed");
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::from_io(e));
        }
        file.sync_all().await.map_err(Error::from_io)?;
        drop(file);
        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "fs_storage: rename failed");
            Error::from_io(e)
        })?;

        debug!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "fs_storage",
            op = "upload",
            object_key = %key,
            size_bytes = stored.size,
            "Object stored"
        );
        Ok(stored)
    }

    async fn fetch(&self, key: &str, _auth_token: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}", key)))
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    async fn delete(&self, key: &str, _auth_token: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(e)),
        }
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => format!("file://{}", self.base_path.join(key).display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_layout() {
        let key = content_key(b"hello", "Portrait.JPG");
        let hash = blake3::hash(b"hello").to_hex().to_string();
        assert_eq!(
            key,
            format!("objects/{}/{}/{}.jpg", &hash[0..2], &hash[2..4], hash)
        );
        assert!(!content_key(b"hello", "no-extension").ends_with('.'));
        assert!(!content_key(b"x", "evil.j/pg").contains("j/pg"));
    }

    #[tokio::test]
    async fn test_upload_fetch_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemObjectStorage::new(dir.path());
        storage.validate().await.unwrap();

        let stored = storage.upload(b"pixels", "a.png", "").await.unwrap();
        assert_eq!(stored.size, 6);
        assert_eq!(storage.fetch(&stored.key, "").await.unwrap(), b"pixels");

        // Same bytes, same key.
        let again = storage.upload(b"pixels", "b.png", "").await.unwrap();
        assert_eq!(again.key, stored.key);

        storage.delete(&stored.key, "").await.unwrap();
        storage.delete(&stored.key, "").await.unwrap();
        let err = storage.fetch(&stored.key, "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemObjectStorage::new(dir.path());
        let err = storage.fetch("../etc/passwd", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_public_url() {
        let storage = FilesystemObjectStorage::new("/srv/objects")
            .with_public_base_url("https://cdn.example/");
        assert_eq!(storage.public_url("objects/ab/cd/x.jpg"), "https://cdn.example/objects/ab/cd/x.jpg");
    }
}
