//! Compiler/renderer binding.
//!
//! Owns the one-time configuration of an external compile engine and the
//! shadow mapping (path to bytes) the engine resolves includes against. The
//! binding validates nothing itself: a render error is reported as
//! [`CompileError::Render`] and the caller decides whether to roll back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

pub mod assets;
#[cfg(test)]
pub mod testing;
pub mod typst_cli;

pub use assets::{AssetCache, AssetSpec};

/// Path to content seen by the engine while rendering.
pub type ShadowMap = BTreeMap<String, Bytes>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Compiler is not configured")]
    NotConfigured,

    #[error("Compiler is already configured")]
    AlreadyConfigured,

    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Failed to fetch asset '{name}': {reason}")]
    AssetFetch { name: String, reason: String },

    #[error("Render failed: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CompileInput {
    pub main_source: String,
    pub shadow: ShadowMap,
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Executable used when no compiler asset is configured.
    pub executable: PathBuf,
    /// Downloadable compiler payload, if any.
    pub asset: Option<AssetSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct RendererOptions {
    /// Font bundle handed to the renderer.
    pub font_asset: Option<AssetSpec>,
}

impl CompilerOptions {
    pub fn assets(&self) -> Vec<AssetSpec> {
        self.asset.iter().cloned().collect()
    }
}

impl RendererOptions {
    pub fn assets(&self) -> Vec<AssetSpec> {
        self.font_asset.iter().cloned().collect()
    }
}

/// A configured engine. Implementations must not keep state between renders.
#[async_trait]
pub trait CompileEngine: Send + Sync {
    /// Renders the preview as SVG markup.
    async fn render_svg(&self, input: &CompileInput) -> Result<String, CompileError>;

    /// Renders the final downloadable format (PDF).
    async fn render_pdf(&self, input: &CompileInput) -> Result<Bytes, CompileError>;
}

/// Builds engines from options. Called at most once per binding.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Whether every payload `load` needs is already available locally.
    async fn is_cached(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
        timeout: Duration,
    ) -> bool;

    async fn load(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
    ) -> Result<Arc<dyn CompileEngine>, CompileError>;
}

pub struct CompilerBinding {
    loader: Arc<dyn EngineLoader>,
    engine: OnceLock<Arc<dyn CompileEngine>>,
    configuring: tokio::sync::Mutex<()>,
    shadow: Mutex<ShadowMap>,
}

impl CompilerBinding {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            engine: OnceLock::new(),
            configuring: tokio::sync::Mutex::new(()),
            shadow: Mutex::new(ShadowMap::new()),
        }
    }

    fn shadow(&self) -> MutexGuard<'_, ShadowMap> {
        self.shadow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_configured(&self) -> bool {
        self.engine.get().is_some()
    }

    pub async fn check_cache(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
        timeout: Duration,
    ) -> bool {
        self.loader.is_cached(compiler, renderer, timeout).await
    }

    /// Loads the engine. Must succeed exactly once; a second call fails with
    /// [`CompileError::AlreadyConfigured`]. A failed load may be retried.
    pub async fn configure(
        &self,
        compiler: &CompilerOptions,
        renderer: &RendererOptions,
    ) -> Result<(), CompileError> {
        let _configuring = self.configuring.lock().await;
        if self.is_configured() {
            return Err(CompileError::AlreadyConfigured);
        }

        let engine = self.loader.load(compiler, renderer).await?;
        self.engine
            .set(engine)
            .map_err(|_| CompileError::AlreadyConfigured)?;
        info!("Compiler configured");
        Ok(())
    }

    /// Replaces the whole shadow mapping with `files`.
    pub fn sync_shadow(&self, files: ShadowMap) {
        let mut shadow = self.shadow();
        debug!("Shadow resync: {} -> {} files", shadow.len(), files.len());
        *shadow = files;
    }

    pub fn reset_shadow(&self) {
        self.shadow().clear();
    }

    pub fn shadow_snapshot(&self) -> ShadowMap {
        self.shadow().clone()
    }

    fn input(&self, main_source: &str) -> CompileInput {
        CompileInput {
            main_source: main_source.to_string(),
            shadow: self.shadow_snapshot(),
        }
    }

    fn engine(&self) -> Result<&Arc<dyn CompileEngine>, CompileError> {
        self.engine.get().ok_or(CompileError::NotConfigured)
    }

    pub async fn render_vector(&self, main_source: &str) -> Result<String, CompileError> {
        let engine = self.engine()?;
        engine.render_svg(&self.input(main_source)).await
    }

    pub async fn render_final(&self, main_source: &str) -> Result<Bytes, CompileError> {
        let engine = self.engine()?;
        engine.render_pdf(&self.input(main_source)).await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedLoader, FAIL_MARKER};
    use super::*;

    fn options() -> (CompilerOptions, RendererOptions) {
        (
            CompilerOptions {
                executable: PathBuf::from("typst"),
                asset: None,
            },
            RendererOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_render_before_configure_fails() {
        let binding = CompilerBinding::new(Arc::new(ScriptedLoader::new()));
        assert!(matches!(
            binding.render_vector("= Hi").await,
            Err(CompileError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_configure_only_once() {
        let loader = Arc::new(ScriptedLoader::new());
        let binding = CompilerBinding::new(loader.clone());
        let (compiler, renderer) = options();

        binding.configure(&compiler, &renderer).await.unwrap();
        assert!(matches!(
            binding.configure(&compiler, &renderer).await,
            Err(CompileError::AlreadyConfigured)
        ));
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let loader = Arc::new(ScriptedLoader::new());
        loader.fail_next_load();
        let binding = CompilerBinding::new(loader.clone());
        let (compiler, renderer) = options();

        assert!(binding.configure(&compiler, &renderer).await.is_err());
        assert!(!binding.is_configured());
        binding.configure(&compiler, &renderer).await.unwrap();
        assert!(binding.is_configured());
    }

    #[tokio::test]
    async fn test_render_sees_current_shadow() {
        let loader = Arc::new(ScriptedLoader::new());
        let binding = CompilerBinding::new(loader.clone());
        let (compiler, renderer) = options();
        binding.configure(&compiler, &renderer).await.unwrap();

        binding.sync_shadow(ShadowMap::from([(
            "/template.yml".to_string(),
            Bytes::from("name: A"),
        )]));
        assert!(binding.render_vector("main").await.unwrap().contains("name: A"));

        binding.sync_shadow(ShadowMap::from([(
            "/template.yml".to_string(),
            Bytes::from(FAIL_MARKER),
        )]));
        assert!(matches!(
            binding.render_vector("main").await,
            Err(CompileError::Render(_))
        ));

        binding.reset_shadow();
        assert!(binding.shadow_snapshot().is_empty());
        assert_eq!(loader.engine().renders(), 2);
    }
}
