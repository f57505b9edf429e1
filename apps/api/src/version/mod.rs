//! Version store: checkpoint and rollback backed by a git repository.
//!
//! The repository lives in the store's host directory, so `/.git` shows up in
//! the virtual filesystem next to the working files. `commit` snapshots the
//! given paths on top of HEAD, `log` walks history from HEAD and `checkout`
//! hard-resets the working files and the current branch to a checkpoint.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    Commit, ErrorClass, ErrorCode, Oid, Repository, ResetType, Signature, Sort, StatusOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::vfs::{normalize_path, Vfs, VfsError};

pub const GIT_DIR: &str = "/.git";
/// Shortest accepted abbreviation of a checkpoint id.
const MIN_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    #[error("Checkpoint id '{0}' is ambiguous")]
    AmbiguousCheckpoint(String),

    #[error("Working tree has uncommitted changes at {0}")]
    DirtyWorkingTree(String),

    #[error("Repository is not initialized")]
    NotInitialized,

    #[error("Path '{0}' cannot be versioned")]
    UntrackablePath(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Version store task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// Working content of a path compared with HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Unmodified,
    Modified,
    /// Present in the working tree, not in HEAD.
    Added,
    /// In HEAD, missing from the working tree.
    Deleted,
    /// In neither.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub id: String,
    pub message: String,
    pub author: Author,
    pub parent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    fn from_commit(commit: &Commit<'_>) -> Self {
        let author = commit.author();
        Self {
            id: commit.id().to_string(),
            message: commit.message().unwrap_or_default().to_string(),
            author: Author {
                name: author.name().unwrap_or_default().to_string(),
                email: author.email().unwrap_or_default().to_string(),
            },
            parent: commit.parent_id(0).ok().map(|id| id.to_string()),
            timestamp: DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
        }
    }
}

fn is_unborn(e: &git2::Error) -> bool {
    matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound)
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>, VersionError> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if is_unborn(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Store path to a path relative to the repository root.
fn repo_path(path: &str) -> Result<PathBuf, VersionError> {
    let normalized = normalize_path(path)?;
    let relative = normalized.trim_start_matches('/');
    if relative.is_empty() || relative == &GIT_DIR[1..] || relative.starts_with(".git/") {
        return Err(VersionError::UntrackablePath(normalized));
    }
    Ok(PathBuf::from(relative))
}

fn resolve_in(repo: &Repository, id: &str) -> Result<Oid, VersionError> {
    let id = id.trim().to_ascii_lowercase();
    if id.len() < MIN_PREFIX_LEN || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VersionError::UnknownCheckpoint(id));
    }
    match repo.find_commit_by_prefix(&id) {
        Ok(commit) => Ok(commit.id()),
        Err(e) if e.code() == ErrorCode::Ambiguous => Err(VersionError::AmbiguousCheckpoint(id)),
        Err(e)
            if matches!(e.code(), ErrorCode::NotFound | ErrorCode::InvalidSpec)
                || matches!(e.class(), ErrorClass::Odb | ErrorClass::Object) =>
        {
            Err(VersionError::UnknownCheckpoint(id))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Clone)]
pub struct VersionStore {
    root: PathBuf,
}

impl VersionStore {
    pub fn new(vfs: &Vfs) -> Self {
        Self {
            root: vfs.root().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens the repository on a blocking thread and runs `op` against it.
    async fn with_repo<T, F>(&self, op: F) -> Result<T, VersionError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, VersionError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&root).map_err(|e| match e.code() {
                ErrorCode::NotFound => VersionError::NotInitialized,
                _ => VersionError::Git(e),
            })?;
            op(&repo)
        })
        .await
        .map_err(|e| VersionError::Task(e.to_string()))?
    }

    /// Creates the repository if it is missing. Returns `true` when a new
    /// repository was created; repeated calls are no-ops.
    pub async fn init(&self) -> Result<bool, VersionError> {
        let root = self.root.clone();
        let created = tokio::task::spawn_blocking(move || match Repository::open(&root) {
            Ok(_) => Ok(false),
            Err(e) if e.code() == ErrorCode::NotFound => {
                Repository::init(&root)?;
                Ok(true)
            }
            Err(e) => Err(VersionError::Git(e)),
        })
        .await
        .map_err(|e| VersionError::Task(e.to_string()))??;

        if created {
            info!("Initialized version store in {}", self.root.display());
        }
        Ok(created)
    }

    pub async fn head(&self) -> Result<Option<String>, VersionError> {
        self.with_repo(|repo| Ok(head_commit(repo)?.map(|commit| commit.id().to_string())))
            .await
    }

    pub async fn status(&self, path: &str) -> Result<FileStatus, VersionError> {
        let relative = repo_path(path)?;
        self.with_repo(move |repo| {
            let status = match repo.status_file(&relative) {
                Ok(status) => status,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(FileStatus::Absent),
                Err(e) => return Err(e.into()),
            };
            let in_head = !(status.is_index_new() || status.is_wt_new());
            let in_working_tree = !(status.is_wt_deleted() || status.is_index_deleted());
            Ok(match (in_head, in_working_tree) {
                (false, false) => FileStatus::Absent,
                (false, true) => FileStatus::Added,
                (true, false) => FileStatus::Deleted,
                (true, true) if status.is_empty() => FileStatus::Unmodified,
                (true, true) => FileStatus::Modified,
            })
        })
        .await
    }

    /// Snapshots `paths` on top of HEAD. Paths not listed keep their HEAD
    /// content; listed paths missing from the working tree are dropped.
    pub async fn commit(
        &self,
        paths: &[&str],
        message: &str,
        author: &Author,
    ) -> Result<Checkpoint, VersionError> {
        let relative = paths
            .iter()
            .map(|path| repo_path(path))
            .collect::<Result<Vec<_>, _>>()?;
        let message = message.to_string();
        let author = author.clone();
        let root = self.root.clone();

        let checkpoint = self
            .with_repo(move |repo| {
                let parent = head_commit(repo)?;
                let mut index = repo.index()?;
                for path in &relative {
                    if root.join(path).is_file() {
                        index.add_path(path)?;
                    } else {
                        match index.remove_path(path) {
                            Ok(()) => {}
                            Err(e) if e.code() == ErrorCode::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }

                let tree_id = index.write_tree()?;
                let unchanged = match &parent {
                    Some(parent) => parent.tree_id() == tree_id,
                    None => index.is_empty(),
                };
                if unchanged {
                    debug!("Commit skipped: tree unchanged");
                    return Err(VersionError::NothingToCommit);
                }
                index.write()?;

                let tree = repo.find_tree(tree_id)?;
                let signature = Signature::now(&author.name, &author.email)?;
                let parents: Vec<&Commit<'_>> = parent.iter().collect();
                let id = repo.commit(Some("HEAD"), &signature, &signature, &message, &tree, &parents)?;
                Ok(Checkpoint::from_commit(&repo.find_commit(id)?))
            })
            .await?;

        info!("Committed {}", checkpoint.id);
        Ok(checkpoint)
    }

    /// Up to `limit` checkpoints reachable from HEAD, newest first.
    pub async fn log(&self, limit: usize) -> Result<Vec<Checkpoint>, VersionError> {
        self.with_repo(move |repo| {
            let mut walk = repo.revwalk()?;
            match walk.push_head() {
                Ok(()) => {}
                Err(e) if is_unborn(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
            walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

            let mut history = Vec::new();
            for oid in walk.take(limit) {
                history.push(Checkpoint::from_commit(&repo.find_commit(oid?)?));
            }
            Ok(history)
        })
        .await
    }

    /// Expands a full id or a unique prefix to a commit id.
    pub async fn resolve(&self, id: &str) -> Result<String, VersionError> {
        let id = id.to_string();
        self.with_repo(move |repo| Ok(resolve_in(repo, &id)?.to_string()))
            .await
    }

    /// Hard-resets the working files and the current branch to `id`, so
    /// checkpoints made after `id` drop out of [`VersionStore::log`].
    /// Untracked files are left alone.
    ///
    /// Without `force`, refuses when a tracked path has uncommitted changes.
    /// Derived state (shadow files, parsed data) is the caller's to refresh.
    pub async fn checkout(&self, id: &str, force: bool) -> Result<Checkpoint, VersionError> {
        let id = id.to_string();
        let checkpoint = self
            .with_repo(move |repo| {
                let commit = repo.find_commit(resolve_in(repo, &id)?)?;

                if !force {
                    let mut options = StatusOptions::new();
                    options.include_untracked(false);
                    let statuses = repo.statuses(Some(&mut options))?;
                    if let Some(dirty) = statuses.iter().find(|entry| !entry.status().is_ignored()) {
                        let path = dirty.path().unwrap_or_default();
                        return Err(VersionError::DirtyWorkingTree(format!("/{path}")));
                    }
                }

                let mut checkout = CheckoutBuilder::new();
                checkout.force();
                repo.reset(commit.as_object(), ResetType::Hard, Some(&mut checkout))?;
                Ok(Checkpoint::from_commit(&commit))
            })
            .await?;

        info!("Checked out {}", checkpoint.id);
        Ok(checkpoint)
    }
}
