use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::fs;
use url::Url;

use crate::{ObjectStore, StorageError, keys::validate_key};

/// Object store rooted at a local directory.
///
/// Writes land in a sibling temporary file and are renamed into place, so a
/// reader never observes a partially written sentinel.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    write_counter: AtomicU64,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write `bytes` to a unique sibling of `path` and return its location.
    async fn write_staging(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|error| StorageError::io(key, error))?;
        }

        let sequence = self.write_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        let staging_path = path.with_file_name(format!(".{file_name}.{}.{sequence}.partial", std::process::id()));

        if let Err(error) = fs::write(&staging_path, bytes).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(StorageError::io(key, error));
        }
        Ok(staging_path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let staging_path = self.write_staging(key, &path, &bytes).await?;
        if let Err(error) = fs::rename(&staging_path, &path).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(StorageError::io(key, error));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let staging_path = self.write_staging(key, &path, &bytes).await?;
        // link(2) fails when the target exists, unlike rename.
        let linked = fs::hard_link(&staging_path, &path).await;
        let _ = fs::remove_file(&staging_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(StorageError::io(key, error)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StorageError::io(key, error)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path).await.map_err(|error| StorageError::io(key, error))
    }

    fn object_url(&self, key: &str) -> String {
        let path = self.root.join(key);
        Url::from_file_path(&path)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(!store.exists("runs/r1/package.tar.gz").await.unwrap());
        store.put("runs/r1/package.tar.gz", b"hello".to_vec()).await.unwrap();

        assert!(store.exists("runs/r1/package.tar.gz").await.unwrap());
        assert_eq!(store.get("runs/r1/package.tar.gz").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_object_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert_eq!(store.get("runs/r1/sentinels/a/1/0.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("a/b.json", b"1".to_vec()).await.unwrap();
        store.put("a/b.json", b"2".to_vec()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.json".to_string()]);
        assert_eq!(store.get("a/b.json").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn put_if_absent_does_not_replace_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(store.put_if_absent("a/b.json", b"1".to_vec()).await.unwrap());
        assert!(!store.put_if_absent("a/b.json", b"2".to_vec()).await.unwrap());

        assert_eq!(store.get("a/b.json").await.unwrap(), Some(b"1".to_vec()));
        let names: Vec<String> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.json".to_string()]);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let error = store.put("../outside", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(error, StorageError::InvalidKey(_)));
    }

    #[test]
    fn object_url_is_a_file_url() {
        let store = LocalObjectStore::new("/srv/datastore");
        assert_eq!(store.object_url("runs/r1/package.tar.gz"), "file:///srv/datastore/runs/r1/package.tar.gz");
    }
}
