//! Compile engine backed by the Typst command-line compiler.
//!
//! Every render materializes the shadow files and the main source into a fresh
//! temp directory and runs `typst compile` against it, so renders share no
//! state.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    AssetCache, CompileEngine, CompileError, CompileInput, CompilerOptions, EngineLoader,
    RendererOptions,
};

const MAIN_FILE: &str = "main.typ";

pub struct TypstCliLoader {
    cache: AssetCache,
}

impl TypstCliLoader {
    pub fn new(cache: AssetCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EngineLoader for TypstCliLoader {
    async fn is_cached(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
        timeout: Duration,
    ) -> bool {
        let mut assets = compiler.assets();
        assets.extend(renderer.assets());
        self.cache.is_warm(&assets, timeout).await
    }

    async fn load(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
    ) -> Result<Arc<dyn CompileEngine>, CompileError> {
        let executable = match &compiler.asset {
            Some(asset) => {
                let path = self.cache.fetch(asset).await?;
                mark_executable(&path).await?;
                path
            }
            None => compiler.executable.clone(),
        };

        // Fonts get their own cache directory so --font-path sees nothing else.
        let font_dir = match &renderer.font_asset {
            Some(asset) => {
                self.cache.fetch(asset).await?;
                Some(self.cache.dir_of(asset)?)
            }
            None => None,
        };

        let output = Command::new(&executable)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CompileError::EngineInit(format!("cannot run {}: {e}", executable.display()))
            })?;
        if !output.status.success() {
            return Err(CompileError::EngineInit(format!(
                "{} --version exited with {}",
                executable.display(),
                output.status
            )));
        }

        info!(
            "Typst engine ready: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        let engine: Arc<dyn CompileEngine> = Arc::new(TypstCli {
            executable,
            font_dir,
        });
        Ok(engine)
    }
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> Result<(), CompileError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> Result<(), CompileError> {
    Ok(())
}

pub struct TypstCli {
    executable: PathBuf,
    font_dir: Option<PathBuf>,
}

/// Writes the shadow files, then the main source, under `root`.
async fn materialize(root: &Path, input: &CompileInput) -> Result<PathBuf, CompileError> {
    for (path, content) in &input.shadow {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|c| c == "..") {
            warn!("Skipping shadow entry with unsafe path '{path}'");
            continue;
        }
        let host = root.join(relative);
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host, content).await?;
    }

    let main = root.join(MAIN_FILE);
    tokio::fs::write(&main, input.main_source.as_bytes()).await?;
    Ok(main)
}

impl TypstCli {
    async fn compile(
        &self,
        input: &CompileInput,
        format: &str,
        output_name: &str,
    ) -> Result<TempDir, CompileError> {
        let workdir = tempfile::tempdir()?;
        let main = materialize(workdir.path(), input).await?;

        let mut command = Command::new(&self.executable);
        command
            .arg("compile")
            .arg("--root")
            .arg(workdir.path())
            .arg("--format")
            .arg(format);
        if let Some(font_dir) = &self.font_dir {
            command.arg("--font-path").arg(font_dir);
        }
        command
            .arg(&main)
            .arg(workdir.path().join(output_name))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("typst compile failed: {stderr}");
            return Err(CompileError::Render(stderr));
        }
        Ok(workdir)
    }
}

#[async_trait]
impl CompileEngine for TypstCli {
    async fn render_svg(&self, input: &CompileInput) -> Result<String, CompileError> {
        let workdir = self.compile(input, "svg", "page-{p}.svg").await?;

        let mut pages = String::new();
        for page in 1.. {
            match tokio::fs::read_to_string(workdir.path().join(format!("page-{page}.svg"))).await
            {
                Ok(svg) => pages.push_str(&svg),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }

        if pages.is_empty() {
            return Err(CompileError::Render("compiler produced no pages".to_string()));
        }
        Ok(pages)
    }

    async fn render_pdf(&self, input: &CompileInput) -> Result<Bytes, CompileError> {
        let workdir = self.compile(input, "pdf", "out.pdf").await?;
        let pdf = tokio::fs::read(workdir.path().join("out.pdf")).await?;
        Ok(Bytes::from(pdf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ShadowMap;

    #[tokio::test]
    async fn test_materialize_writes_shadow_and_main() {
        let dir = tempfile::tempdir().unwrap();
        let input = CompileInput {
            main_source: "#let data = yaml(\"template.yml\")".to_string(),
            shadow: ShadowMap::from([
                ("/template.yml".to_string(), Bytes::from("personal: {}")),
                ("/assets/logo.svg".to_string(), Bytes::from("<svg/>")),
                ("/../escape".to_string(), Bytes::from("nope")),
            ]),
        };

        let main = materialize(dir.path(), &input).await.unwrap();

        assert_eq!(main, dir.path().join("main.typ"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("template.yml")).unwrap(),
            "personal: {}"
        );
        assert!(dir.path().join("assets/logo.svg").exists());
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }

    #[tokio::test]
    async fn test_load_reports_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let loader = TypstCliLoader::new(AssetCache::new(dir.path()));
        let compiler = CompilerOptions {
            executable: dir.path().join("no-such-typst"),
            asset: None,
        };

        let result = loader.load(&compiler, &RendererOptions::default()).await;
        assert!(matches!(result, Err(CompileError::EngineInit(_))));
    }

    #[tokio::test]
    async fn test_local_executable_counts_as_cached() {
        let dir = tempfile::tempdir().unwrap();
        let loader = TypstCliLoader::new(AssetCache::new(dir.path()));
        let compiler = CompilerOptions {
            executable: PathBuf::from("typst"),
            asset: None,
        };

        assert!(
            loader
                .is_cached(&compiler, &RendererOptions::default(), Duration::from_millis(4))
                .await
        );
    }
}
