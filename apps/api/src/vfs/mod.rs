//! Virtual filesystem: a path-addressed byte store persisted under a fixed store name.
//!
//! Every document session owns exactly one store. Paths are absolute and
//! slash-separated (`/main.typ`, `/.git/HEAD`); backends guarantee that a
//! `write` either lands completely or leaves the previous content readable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod disk;
pub mod handlers;

pub use disk::DiskBackend;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("IO error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl VfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

/// Storage behind a [`Vfs`]. Implementations receive already-normalized paths.
#[async_trait]
pub trait VfsBackend: Send + Sync {
    /// The fixed identifier this store is persisted under.
    fn store_name(&self) -> &str;

    /// Host directory holding the store. The version store keeps its
    /// repository here.
    fn root(&self) -> &Path;

    async fn read(&self, path: &str) -> Result<Bytes, VfsError>;

    /// Replaces the content at `path`, creating parent directories as needed.
    async fn write(&self, path: &str, content: Bytes) -> Result<(), VfsError>;

    async fn remove(&self, path: &str) -> Result<(), VfsError>;

    /// Names (not paths) of the direct children of `dir`, sorted.
    async fn list(&self, dir: &str) -> Result<Vec<String>, VfsError>;

    /// Deletes the whole store. Irreversible.
    async fn destroy(&self) -> Result<(), VfsError>;
}

/// Cheaply cloneable handle to the session's filesystem.
#[derive(Clone)]
pub struct Vfs {
    backend: Arc<dyn VfsBackend>,
}

impl Vfs {
    pub fn new(backend: impl VfsBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn store_name(&self) -> &str {
        self.backend.store_name()
    }

    pub fn root(&self) -> &Path {
        self.backend.root()
    }

    pub async fn read(&self, path: &str) -> Result<Bytes, VfsError> {
        let path = normalize_path(path)?;
        self.backend.read(&path).await
    }

    pub async fn read_to_string(&self, path: &str) -> Result<String, VfsError> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| VfsError::Io {
            path: path.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Like [`Vfs::read`], but a missing file is `Ok(None)`.
    pub async fn read_optional(&self, path: &str) -> Result<Option<Bytes>, VfsError> {
        match self.read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, path: &str, content: impl Into<Bytes>) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(VfsError::InvalidPath {
                path,
                reason: "cannot write to the root directory",
            });
        }
        self.backend.write(&path, content.into()).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), VfsError> {
        let path = normalize_path(path)?;
        self.backend.remove(&path).await
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<String>, VfsError> {
        let dir = normalize_path(dir)?;
        self.backend.list(&dir).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, VfsError> {
        Ok(self.read_optional(path).await?.is_some())
    }

    pub async fn destroy(&self) -> Result<(), VfsError> {
        self.backend.destroy().await
    }
}

/// Validates and canonicalizes an absolute store path.
///
/// Repeated and trailing slashes collapse; `.`/`..` components, backslashes
/// and NUL bytes are rejected.
pub fn normalize_path(path: &str) -> Result<String, VfsError> {
    let invalid = |reason| VfsError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("path must be absolute"));
    }
    if path.contains('\0') || path.contains('\\') {
        return Err(invalid("path contains a forbidden character"));
    }

    let mut normalized = String::with_capacity(path.len());
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(invalid("relative components are not allowed"));
        }
        normalized.push('/');
        normalized.push_str(component);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Splits a normalized path into its parent directory and file name.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_slashes() {
        assert_eq!(normalize_path("//main.typ").unwrap(), "/main.typ");
        assert_eq!(normalize_path("/.git//objects/").unwrap(), "/.git/objects");
        assert_eq!(normalize_path("/").unwrap(), "/");
    }

    #[test]
    fn test_normalize_rejects_relative_paths() {
        assert!(normalize_path("main.typ").is_err());
        assert!(normalize_path("/a/../b").is_err());
        assert!(normalize_path("/a/./b").is_err());
        assert!(normalize_path("/a\\b").is_err());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/main.typ"), ("/", "main.typ"));
        assert_eq!(split_parent("/.git/HEAD"), ("/.git", "HEAD"));
    }

    async fn temp_vfs() -> (tempfile::TempDir, Vfs) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "test").await.unwrap());
        (dir, vfs)
    }

    #[tokio::test]
    async fn test_read_optional_maps_missing_to_none() {
        let (_dir, vfs) = temp_vfs().await;
        assert!(vfs.read_optional("/nope").await.unwrap().is_none());
        vfs.write("/yes", "1").await.unwrap();
        assert_eq!(vfs.read_optional("/yes").await.unwrap().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_write_to_root_rejected() {
        let (_dir, vfs) = temp_vfs().await;
        assert!(matches!(
            vfs.write("/", "x").await,
            Err(VfsError::InvalidPath { .. })
        ));
    }
}
