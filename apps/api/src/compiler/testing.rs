//! Scripted engine double for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    CompileEngine, CompileError, CompileInput, CompilerOptions, EngineLoader, RendererOptions,
};

/// Any render whose input contains this text fails.
pub const FAIL_MARKER: &str = "__fail_render__";

#[derive(Default)]
pub struct ScriptedEngine {
    renders: AtomicUsize,
    delay_ms: AtomicU64,
}

impl ScriptedEngine {
    /// Number of render calls so far, failed ones included.
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn render(&self, input: &CompileInput) -> Result<String, CompileError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut body = input.main_source.clone();
        for content in input.shadow.values() {
            body.push_str(&String::from_utf8_lossy(content));
        }
        if body.contains(FAIL_MARKER) {
            return Err(CompileError::Render("scripted failure".to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl CompileEngine for ScriptedEngine {
    async fn render_svg(&self, input: &CompileInput) -> Result<String, CompileError> {
        let body = self.render(input).await?;
        Ok(format!("<svg>{body}</svg>"))
    }

    async fn render_pdf(&self, input: &CompileInput) -> Result<Bytes, CompileError> {
        let body = self.render(input).await?;
        Ok(Bytes::from(format!("%PDF-1.7\n{body}")))
    }
}

#[derive(Default)]
pub struct ScriptedLoader {
    engine: Arc<ScriptedEngine>,
    loads: AtomicUsize,
    fail_next: AtomicBool,
    cold: AtomicBool,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> Arc<ScriptedEngine> {
        self.engine.clone()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn fail_next_load(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Makes cache checks report cold.
    pub fn set_cold(&self) {
        self.cold.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn is_cached(
        &self,
        _compiler: &CompilerOptions,
        _renderer: &RendererOptions,
        _timeout: Duration,
    ) -> bool {
        !self.cold.load(Ordering::SeqCst)
    }

    async fn load(
        &self,
        _compiler: &CompilerOptions,
        _renderer: &RendererOptions,
    ) -> Result<Arc<dyn CompileEngine>, CompileError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CompileError::EngineInit("scripted load failure".to_string()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let engine: Arc<dyn CompileEngine> = self.engine.clone();
        Ok(engine)
    }
}
