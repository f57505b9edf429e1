//! Warm cache for engine payloads fetched over the network.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Client, Url};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::CompileError;

/// A named payload and where to download it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSpec {
    /// Cache subdirectory holding this payload.
    pub name: String,
    pub url: String,
}

impl AssetSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone)]
pub struct AssetCache {
    dir: PathBuf,
    client: Client,
}

impl AssetCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            client: Client::new(),
        }
    }

    /// Directory the payload named `asset.name` is cached in.
    pub fn dir_of(&self, asset: &AssetSpec) -> Result<PathBuf, CompileError> {
        if !is_plain_name(&asset.name) {
            return Err(CompileError::AssetFetch {
                name: asset.name.clone(),
                reason: "asset name must be a plain file name".to_string(),
            });
        }
        Ok(self.dir.join(&asset.name))
    }

    /// `<dir>/<name>/<last URL segment>`, keeping the file's own name and
    /// extension. URLs without a usable last segment fall back to the asset name.
    fn path_of(&self, asset: &AssetSpec) -> Result<PathBuf, CompileError> {
        let file_name = Url::parse(&asset.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .map(str::to_string)
            })
            .filter(|segment| is_plain_name(segment))
            .unwrap_or_else(|| asset.name.clone());
        Ok(self.dir_of(asset)?.join(file_name))
    }

    /// True iff every asset is already on disk. Decided within `timeout`; a
    /// check that runs out of time counts as cold.
    pub async fn is_warm(&self, assets: &[AssetSpec], timeout: Duration) -> bool {
        let check = async {
            for asset in assets {
                let Ok(path) = self.path_of(asset) else {
                    return false;
                };
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return false;
                }
            }
            true
        };

        match tokio::time::timeout(timeout, check).await {
            Ok(warm) => {
                debug!("Asset cache check: warm={warm}");
                warm
            }
            Err(_) => {
                debug!("Asset cache check timed out after {}ms", timeout.as_millis());
                false
            }
        }
    }

    /// Returns the cached file for `asset`, downloading it on a miss. The
    /// download is synced to a temp file first and then renamed into place.
    pub async fn fetch(&self, asset: &AssetSpec) -> Result<PathBuf, CompileError> {
        let target = self.path_of(asset)?;
        if tokio::fs::try_exists(&target).await? {
            return Ok(target);
        }

        let fetch_error = |reason: String| CompileError::AssetFetch {
            name: asset.name.clone(),
            reason,
        };

        info!("Fetching asset '{}' from {}", asset.name, asset.url);
        let response = self
            .client
            .get(&asset.url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Asset '{}' fetch returned {status}", asset.name);
            return Err(fetch_error(format!("server returned {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let body_len = body.len();
        let staged = target.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = staged.parent().unwrap_or(&staged).to_path_buf();
            std::fs::create_dir_all(&parent)?;
            let mut staging = NamedTempFile::new_in(&parent)?;
            staging.write_all(&body)?;
            staging.as_file().sync_all()?;
            staging.persist(&staged).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| fetch_error(format!("cache write task failed: {e}")))??;

        info!("Cached asset '{}' ({} bytes)", asset.name, body_len);
        Ok(target)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}
