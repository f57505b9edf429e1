//! Document fixtures over a throwaway on-disk store and the scripted engine.

use std::path::PathBuf;
use std::sync::Arc;

use super::observers::RecordingSink;
use super::{Document, DocumentOptions};
use crate::compiler::testing::ScriptedLoader;
use crate::compiler::{CompilerOptions, RendererOptions};
use crate::vfs::{DiskBackend, Vfs};
use tempfile::TempDir;

pub struct Harness {
    pub document: Arc<Document>,
    pub vfs: Vfs,
    pub loader: Arc<ScriptedLoader>,
    pub sink: Arc<RecordingSink>,
    pub dir: Arc<TempDir>,
}

pub fn options() -> DocumentOptions {
    DocumentOptions::new(
        CompilerOptions {
            executable: PathBuf::from("typst"),
            asset: None,
        },
        RendererOptions::default(),
    )
}

/// Builds and initializes a document over `vfs`, which lives inside `dir`.
/// The compiler is not loaded.
pub async fn document_on(vfs: Vfs, dir: Arc<TempDir>) -> Harness {
    let loader = Arc::new(ScriptedLoader::new());
    let sink = Arc::new(RecordingSink::default());
    let document = Arc::new(Document::new(
        vfs.clone(),
        loader.clone(),
        sink.clone(),
        options(),
    ));
    document.init().await.unwrap();
    Harness {
        document,
        vfs,
        loader,
        sink,
        dir,
    }
}

pub async fn loaded_document() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let vfs = Vfs::new(DiskBackend::open(dir.path(), "resume-bandhuu").await.unwrap());
    document_on(vfs, Arc::new(dir)).await
}

/// Initialized document with the compiler loaded.
pub async fn ready_document() -> Harness {
    let harness = loaded_document().await;
    harness.document.load_compiler().await.unwrap();
    harness
}
