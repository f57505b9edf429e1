//! Document mutation gateway.
//!
//! Ties the filesystem, version store, readiness gates and compiler binding
//! into one document session. Every visible state is either the last document
//! that rendered or a reported failure: `set_data` writes, re-syncs the shadow
//! mapping, renders, and on a failed render puts the previous bytes back.
//!
//! Lifecycle: `Uninitialized -> LoadingFs -> ReadyToLoad -> LoadingCompiler ->
//! ReadyToCompile`. Loading the compiler is always an explicit call.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compiler::{
    CompileError, CompilerBinding, CompilerOptions, EngineLoader, RendererOptions, ShadowMap,
};
use crate::models::ResumeData;
use crate::readiness::{Readiness, ReadinessFlags};
use crate::version::{Author, Checkpoint, FileStatus, VersionError, VersionStore};
use crate::vfs::{Vfs, VfsError};

pub mod handlers;
pub mod observers;
pub mod template;
#[cfg(test)]
pub mod testing;
pub mod transcript;

pub use observers::{
    DocumentEvent, DocumentObserver, EventSink, Notice, ObserverSet, Subscription, TracingSink,
};
pub use template::TemplateDescriptor;
pub use transcript::{MessagePart, Role, Transcript, TranscriptEntry};

const CHECKPOINT_MESSAGE: &str = "Checkpoint";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Error building the document with the updated file at {path}; the file was reverted")]
    BuildFailed {
        path: String,
        #[source]
        source: CompileError,
    },

    #[error("Required files missing: {}", missing.join(", "))]
    SetupInvalid { missing: Vec<String> },

    #[error("Expression failed: {reason}")]
    ExpressionFailed { expression: String, reason: String },

    #[error("Failed to reset the document store: {0}")]
    ResetFailed(#[source] VfsError),

    #[error("Document is not ready: {0}")]
    NotReady(&'static str),

    #[error("Failed to revert {path} after a failed build: {source}")]
    RollbackFailed {
        path: String,
        #[source]
        source: VfsError,
    },

    #[error("Invalid document data: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] VfsError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Compiler(#[from] CompileError),
}

impl From<serde_yaml::Error> for DocumentError {
    fn from(e: serde_yaml::Error) -> Self {
        DocumentError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentPhase {
    Uninitialized,
    LoadingFs,
    ReadyToLoad,
    LoadingCompiler,
    ReadyToCompile,
}

#[derive(Debug, Clone)]
pub struct DocumentOptions {
    pub template: TemplateDescriptor,
    pub compiler: CompilerOptions,
    pub renderer: RendererOptions,
    pub author: Author,
}

impl DocumentOptions {
    pub fn new(compiler: CompilerOptions, renderer: RendererOptions) -> Self {
        Self {
            template: TemplateDescriptor::resume(),
            compiler,
            renderer,
            author: Author {
                name: "Resume Bandhuu".to_string(),
                email: "resume@bandhuu.com".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointOutcome {
    Created { checkpoint: Checkpoint },
    NothingToCommit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub checkpoint: Checkpoint,
    pub removed_entries: usize,
}

pub struct Document {
    options: DocumentOptions,
    vfs: Vfs,
    versions: VersionStore,
    compiler: CompilerBinding,
    readiness: Readiness,
    phase: Mutex<DocumentPhase>,
    data: RwLock<Option<ResumeData>>,
    /// Single-flight guard over everything that writes the store.
    mutation: tokio::sync::Mutex<()>,
    observers: ObserverSet,
    transcript: Transcript,
    sink: Arc<dyn EventSink>,
    http: Client,
}

impl Document {
    pub fn new(
        vfs: Vfs,
        loader: Arc<dyn EngineLoader>,
        sink: Arc<dyn EventSink>,
        options: DocumentOptions,
    ) -> Self {
        Self {
            versions: VersionStore::new(&vfs),
            transcript: Transcript::new(vfs.clone()),
            compiler: CompilerBinding::new(loader),
            readiness: Readiness::new(),
            phase: Mutex::new(DocumentPhase::Uninitialized),
            data: RwLock::new(None),
            mutation: tokio::sync::Mutex::new(()),
            observers: ObserverSet::default(),
            sink,
            http: Client::new(),
            options,
            vfs,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // State
    // ────────────────────────────────────────────────────────────────────────

    fn phase_lock(&self) -> MutexGuard<'_, DocumentPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: DocumentPhase) {
        let mut current = self.phase_lock();
        debug!("Document phase {:?} -> {phase:?}", *current);
        *current = phase;
    }

    pub fn phase(&self) -> DocumentPhase {
        *self.phase_lock()
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn readiness_flags(&self) -> ReadinessFlags {
        self.readiness.flags()
    }

    pub fn template(&self) -> &TemplateDescriptor {
        &self.options.template
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    fn require_loaded(&self) -> Result<(), DocumentError> {
        if self.readiness.load.is_ready() {
            Ok(())
        } else {
            Err(DocumentError::NotReady("document files are not loaded"))
        }
    }

    fn require_compiler(&self) -> Result<(), DocumentError> {
        if self.readiness.compile.is_ready() {
            Ok(())
        } else {
            Err(DocumentError::NotReady("compiler is not loaded"))
        }
    }

    fn mirror(&self) -> Option<ResumeData> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_mirror(&self, data: Option<ResumeData>) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
    }

    // ────────────────────────────────────────────────────────────────────────
    // Initialization
    // ────────────────────────────────────────────────────────────────────────

    /// Brings the store to `ReadyToLoad`, writing default files for any that
    /// are missing. Safe to call repeatedly.
    pub async fn init(&self) -> Result<(), DocumentError> {
        let _guard = self.mutation.lock().await;
        if self.readiness.load.is_ready() {
            return Ok(());
        }

        self.set_phase(DocumentPhase::LoadingFs);
        if let Err(e) = self.prepare_store().await {
            self.set_phase(DocumentPhase::Uninitialized);
            return Err(e);
        }

        self.set_phase(DocumentPhase::ReadyToLoad);
        self.sink.notice(Notice::ReadyToLoad);
        self.readiness.load.set_ready();
        Ok(())
    }

    async fn prepare_store(&self) -> Result<(), DocumentError> {
        match self.check_setup().await {
            Ok(()) => {}
            Err(DocumentError::SetupInvalid { missing }) => {
                warn!("Invalid setup, populating defaults for: {}", missing.join(", "));
                self.populate_defaults(&missing).await?;
            }
            Err(e) => return Err(e),
        }

        self.versions.init().await?;
        self.transcript.load().await?;

        let data = self.read_data().await?;
        self.set_mirror(Some(data));
        self.sync_shadow().await?;
        info!("Document '{}' loaded", self.vfs.store_name());
        Ok(())
    }

    async fn check_setup(&self) -> Result<(), DocumentError> {
        let mut missing = Vec::new();
        for path in self.options.template.important_files() {
            if !self.vfs.exists(path).await? {
                missing.push(path.to_string());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DocumentError::SetupInvalid { missing })
        }
    }

    async fn populate_defaults(&self, missing: &[String]) -> Result<(), DocumentError> {
        for path in missing {
            let content = self
                .options
                .template
                .default_content(&self.http, path)
                .await;
            self.vfs.write(path, content).await?;
        }
        Ok(())
    }

    async fn read_data(&self) -> Result<ResumeData, DocumentError> {
        let source = self.vfs.read_to_string(&self.options.template.data_path).await?;
        Ok(ResumeData::from_yaml(&source)?)
    }

    /// Remaps every important file into the compiler's shadow.
    async fn sync_shadow(&self) -> Result<(), DocumentError> {
        let mut files = ShadowMap::new();
        for path in self.options.template.important_files() {
            files.insert(path.to_string(), self.vfs.read(path).await?);
        }
        self.compiler.sync_shadow(files);
        Ok(())
    }

    /// Configures the compiler once the files are ready. Waits for the load
    /// gate when called early.
    pub async fn load_compiler(&self) -> Result<(), DocumentError> {
        if self.readiness.compile.is_ready() {
            return Ok(());
        }
        self.readiness.load.wait().await;

        self.set_phase(DocumentPhase::LoadingCompiler);
        match self
            .compiler
            .configure(&self.options.compiler, &self.options.renderer)
            .await
        {
            Ok(()) => {}
            Err(CompileError::AlreadyConfigured) => {
                self.readiness.compile.wait().await;
                return Ok(());
            }
            Err(e) => {
                error!("Compiler load failed: {e}");
                self.set_phase(DocumentPhase::ReadyToLoad);
                return Err(e.into());
            }
        }

        self.set_phase(DocumentPhase::ReadyToCompile);
        self.sink.notice(Notice::ReadyToCompile);
        self.readiness.compile.set_ready();
        Ok(())
    }

    /// Loads the compiler only if its payloads are already cached. Returns
    /// whether the compiler is ready afterwards.
    pub async fn auto_load_if_cached(&self, timeout: Duration) -> Result<bool, DocumentError> {
        if self.readiness.compile.is_ready() {
            return Ok(true);
        }
        let warm = self
            .compiler
            .check_cache(&self.options.compiler, &self.options.renderer, timeout)
            .await;
        if !warm {
            info!("Compiler payloads not cached; waiting for an explicit load");
            return Ok(false);
        }
        self.load_compiler().await?;
        Ok(true)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Data
    // ────────────────────────────────────────────────────────────────────────

    pub fn get_data(&self) -> Result<ResumeData, DocumentError> {
        self.mirror()
            .ok_or(DocumentError::NotReady("document files are not loaded"))
    }

    /// Takes the mutation lock. The guard reads the data it will replace, so a
    /// read-modify-write cannot interleave with another mutation.
    pub async fn begin_mutation(&self) -> Result<MutationGuard<'_>, DocumentError> {
        let lock = self.mutation.lock().await;
        self.require_compiler()?;
        let current = self.get_data()?;
        Ok(MutationGuard {
            document: self,
            current,
            _lock: lock,
        })
    }

    pub async fn set_data(&self, data: ResumeData) -> Result<(), DocumentError> {
        self.begin_mutation().await?.commit(data).await
    }

    /// Renders the current shadow for validation. A render failure is a
    /// `BuildFailed` attributed to `path`.
    async fn validate(&self, path: &str) -> Result<String, DocumentError> {
        self.sync_shadow().await?;
        let main = self
            .vfs
            .read_to_string(&self.options.template.main_path)
            .await?;
        self.compiler
            .render_vector(&main)
            .await
            .map_err(|source| DocumentError::BuildFailed {
                path: path.to_string(),
                source,
            })
    }

    async fn apply(&self, data: ResumeData) -> Result<(), DocumentError> {
        let path = self.options.template.data_path.clone();
        let serialized = data.to_yaml()?;
        let previous = self.vfs.read(&path).await?;

        self.vfs.write(&path, serialized).await?;
        match self.validate(&path).await {
            Ok(preview) => {
                self.set_mirror(Some(data));
                self.observers.notify(&DocumentEvent::Updated { preview });
                Ok(())
            }
            Err(e) => {
                warn!("Mutation of {path} rejected: {e:?}");
                self.rollback(&path, previous).await?;
                if let DocumentError::BuildFailed { source, .. } = &e {
                    self.sink.notice(Notice::BuildFailed {
                        path: path.clone(),
                        message: source.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn rollback(&self, path: &str, previous: Bytes) -> Result<(), DocumentError> {
        if let Err(source) = self.vfs.write(path, previous).await {
            error!("Rollback of {path} failed: {source}");
            return Err(DocumentError::RollbackFailed {
                path: path.to_string(),
                source,
            });
        }
        if let Err(e) = self.sync_shadow().await {
            error!("Shadow resync after rollback of {path} failed: {e}");
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ────────────────────────────────────────────────────────────────────────

    /// Commits the important files when the data file changed since the last
    /// checkpoint, and appends a marker to the transcript.
    pub async fn create_checkpoint(&self) -> Result<CheckpointOutcome, DocumentError> {
        let _guard = self.mutation.lock().await;
        self.require_loaded()?;

        let status = self
            .versions
            .status(&self.options.template.data_path)
            .await?;
        if status == FileStatus::Unmodified {
            self.sink.notice(Notice::NothingToCommit);
            return Ok(CheckpointOutcome::NothingToCommit);
        }

        let paths = self.options.template.important_files();
        let checkpoint = match self
            .versions
            .commit(&paths, CHECKPOINT_MESSAGE, &self.options.author)
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(VersionError::NothingToCommit) => {
                self.sink.notice(Notice::NothingToCommit);
                return Ok(CheckpointOutcome::NothingToCommit);
            }
            Err(e) => return Err(e.into()),
        };

        self.transcript.append_checkpoint(&checkpoint.id).await?;
        self.sink.notice(Notice::CheckpointCreated {
            id: checkpoint.id.clone(),
        });
        Ok(CheckpointOutcome::Created { checkpoint })
    }

    pub async fn checkpoints(&self, limit: usize) -> Result<Vec<Checkpoint>, DocumentError> {
        self.require_loaded()?;
        Ok(self.versions.log(limit).await?)
    }

    /// Hard-resets the store to `id`, reloads derived state and drops the
    /// transcript entries recorded after the checkpoint.
    pub async fn restore_to_checkpoint(&self, id: &str) -> Result<RestoreReport, DocumentError> {
        let _guard = self.mutation.lock().await;
        self.require_loaded()?;

        let checkpoint = self.versions.checkout(id, true).await?;
        let data = self.read_data().await?;
        self.set_mirror(Some(data));
        self.sync_shadow().await?;

        let preview = if self.readiness.compile.is_ready() {
            match self.validate(&self.options.template.data_path).await {
                Ok(svg) => Some(svg),
                Err(e) => {
                    warn!("Restored checkpoint {} does not render: {e:?}", checkpoint.id);
                    None
                }
            }
        } else {
            None
        };

        let removed_entries = match self
            .transcript
            .truncate_after_checkpoint(&checkpoint.id)
            .await?
        {
            Some(removed) => removed,
            None => {
                warn!("No transcript marker for checkpoint {}", checkpoint.id);
                0
            }
        };

        self.observers.notify(&DocumentEvent::Restored {
            checkpoint: checkpoint.id.clone(),
            preview,
        });
        self.sink.notice(Notice::CheckpointRestored {
            id: checkpoint.id.clone(),
            removed_entries,
        });
        info!("Restored checkpoint {}", checkpoint.id);
        Ok(RestoreReport {
            checkpoint,
            removed_entries,
        })
    }

    // ────────────────────────────────────────────────────────────────────────
    // Rendering and reset
    // ────────────────────────────────────────────────────────────────────────

    pub async fn render_preview(&self) -> Result<String, DocumentError> {
        let _guard = self.mutation.lock().await;
        self.require_compiler()?;
        self.validate(&self.options.template.main_path).await
    }

    /// Final-format bytes for download.
    pub async fn export_pdf(&self) -> Result<Bytes, DocumentError> {
        let _guard = self.mutation.lock().await;
        self.require_compiler()?;
        self.sync_shadow().await?;
        let main_path = &self.options.template.main_path;
        let main = self.vfs.read_to_string(main_path).await?;
        self.compiler
            .render_final(&main)
            .await
            .map_err(|source| DocumentError::BuildFailed {
                path: main_path.clone(),
                source,
            })
    }

    /// Deletes the whole store, then repopulates it from defaults. The
    /// readiness gates stay open.
    pub async fn reset(&self) -> Result<(), DocumentError> {
        let _guard = self.mutation.lock().await;

        self.vfs.destroy().await.map_err(|e| {
            error!("Store reset failed: {e}");
            DocumentError::ResetFailed(e)
        })?;
        self.set_mirror(None);
        self.compiler.reset_shadow();
        self.prepare_store().await?;
        self.sink.notice(Notice::StoreReset);

        if self.readiness.compile.is_ready() {
            let preview = self.validate(&self.options.template.data_path).await?;
            self.observers.notify(&DocumentEvent::Updated { preview });
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Observers
    // ────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, observer: Arc<dyn DocumentObserver>) -> bool {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn DocumentObserver>) -> bool {
        self.observers.unsubscribe(observer)
    }

    /// Live event feed for one consumer.
    pub fn watch(self: &Arc<Self>) -> Subscription {
        Subscription::new(self.clone())
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// The session's filesystem.
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }
}

/// Exclusive access to the document for one read-modify-write.
pub struct MutationGuard<'a> {
    document: &'a Document,
    current: ResumeData,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl MutationGuard<'_> {
    /// The data as of taking the lock.
    pub fn current(&self) -> &ResumeData {
        &self.current
    }

    /// Writes, validates and publishes `data`, or restores the previous file
    /// and returns the failure.
    pub async fn commit(self, data: ResumeData) -> Result<(), DocumentError> {
        self.document.apply(data).await
    }
}
