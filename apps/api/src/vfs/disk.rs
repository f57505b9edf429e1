use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::Builder;
use tracing::{debug, info};

use super::{split_parent, VfsBackend, VfsError};

/// Prefix of in-flight write files; never reported by `list`.
const TEMP_PREFIX: &str = ".vfs-tmp-";

/// Directory-backed store living at `<data_dir>/<store_name>`.
///
/// Writes go to a sibling temp file that is synced and then renamed over the
/// target, so readers observe either the old or the new content.
pub struct DiskBackend {
    name: String,
    root: PathBuf,
}

impl DiskBackend {
    pub async fn open(data_dir: impl AsRef<Path>, store_name: &str) -> Result<Self, VfsError> {
        if store_name.is_empty() || store_name.contains(['/', '\\']) || store_name == ".." {
            return Err(VfsError::InvalidPath {
                path: store_name.to_string(),
                reason: "store name must be a single path component",
            });
        }

        let root = data_dir.as_ref().join(store_name);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| io_error(&root, source))?;

        info!("Opened store '{store_name}' at {}", root.display());
        Ok(Self {
            name: store_name.to_string(),
            root,
        })
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> VfsError {
    VfsError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl VfsBackend for DiskBackend {
    fn store_name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: &str) -> Result<Bytes, VfsError> {
        let host = self.host_path(path);
        match tokio::fs::read(&host).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(VfsError::NotFound(path.to_string())),
            Err(e) => Err(io_error(&host, e)),
        }
    }

    async fn write(&self, path: &str, content: Bytes) -> Result<(), VfsError> {
        let (parent, name) = split_parent(path);
        let host_parent = self.host_path(parent);
        let target = host_parent.join(name);
        let len = content.len();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&host_parent).map_err(|e| io_error(&host_parent, e))?;
            let mut staging = Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&host_parent)
                .map_err(|e| io_error(&host_parent, e))?;
            staging
                .write_all(&content)
                .and_then(|()| staging.as_file().sync_all())
                .map_err(|e| io_error(staging.path(), e))?;
            // A failed persist hands the temp file back; dropping it deletes it.
            staging
                .persist(&target)
                .map_err(|e| io_error(&target, e.error))?;
            Ok::<_, VfsError>(())
        })
        .await
        .map_err(|e| io_error(&self.root, std::io::Error::new(ErrorKind::Other, e)))??;

        debug!("Wrote {len} bytes to {path}");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), VfsError> {
        let host = self.host_path(path);
        match tokio::fs::remove_file(&host).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(VfsError::NotFound(path.to_string())),
            Err(e) => Err(io_error(&host, e)),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, VfsError> {
        let host = self.host_path(dir);
        let mut entries = match tokio::fs::read_dir(&host).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VfsError::NotFound(dir.to_string()))
            }
            Err(e) => return Err(io_error(&host, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&host, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TEMP_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn destroy(&self) -> Result<(), VfsError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&self.root, e)),
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        info!("Destroyed store '{}'", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Vfs;

    #[tokio::test]
    async fn test_content_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vfs = Vfs::new(DiskBackend::open(dir.path(), "store").await.unwrap());
            vfs.write("/template.yml", "personal:\n  name: A\n")
                .await
                .unwrap();
        }
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "store").await.unwrap());
        assert_eq!(
            vfs.read_to_string("/template.yml").await.unwrap(),
            "personal:\n  name: A\n"
        );
    }

    #[tokio::test]
    async fn test_stores_are_isolated_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = Vfs::new(DiskBackend::open(dir.path(), "a").await.unwrap());
        let b = Vfs::new(DiskBackend::open(dir.path(), "b").await.unwrap());
        a.write("/main.typ", "a").await.unwrap();
        assert!(b.read("/main.typ").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "store").await.unwrap());
        vfs.write("/.git/HEAD", "one").await.unwrap();
        vfs.write("/.git/HEAD", "two").await.unwrap();

        assert_eq!(vfs.read_to_string("/.git/HEAD").await.unwrap(), "two");
        assert_eq!(vfs.list("/.git").await.unwrap(), vec!["HEAD"]);
        assert_eq!(vfs.list("/").await.unwrap(), vec![".git"]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_old_content_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "store").await.unwrap());
        vfs.write("/sections/work.yml", "- Acme").await.unwrap();

        // Renaming a file over a non-empty directory fails.
        assert!(vfs.write("/sections", "flat").await.is_err());

        assert_eq!(vfs.list("/").await.unwrap(), vec!["sections"]);
        let on_disk: Vec<_> = std::fs::read_dir(dir.path().join("store"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(on_disk, vec!["sections"]);
        assert_eq!(
            vfs.read_to_string("/sections/work.yml").await.unwrap(),
            "- Acme"
        );
    }

    #[tokio::test]
    async fn test_destroy_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "store").await.unwrap());
        vfs.write("/main.typ", "x").await.unwrap();
        vfs.destroy().await.unwrap();

        assert!(vfs.list("/").await.unwrap().is_empty());
        vfs.write("/main.typ", "y").await.unwrap();
        assert_eq!(vfs.read_to_string("/main.typ").await.unwrap(), "y");
    }

    #[tokio::test]
    async fn test_rejects_nested_store_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskBackend::open(dir.path(), "a/b").await.is_err());
    }
}
