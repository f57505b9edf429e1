//! Axum route handlers for browsing the document's files.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::errors::AppError;
use crate::state::AppState;
use crate::version::GIT_DIR;
use crate::vfs::{normalize_path, VfsError};

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<String>,
}

fn is_repository_path(path: &str) -> bool {
    path == GIT_DIR || path.starts_with(&format!("{GIT_DIR}/"))
}

fn vfs_error(e: VfsError) -> AppError {
    match e {
        VfsError::NotFound(path) => AppError::NotFound(format!("File {path} not found")),
        VfsError::InvalidPath { .. } => AppError::Validation(e.to_string()),
        VfsError::Io { .. } => AppError::Storage(e.to_string()),
    }
}

/// GET /api/v1/files
///
/// Names at the root of the store. Repository metadata is not listed.
pub async fn handle_list_files(
    State(state): State<AppState>,
) -> Result<Json<FileListResponse>, AppError> {
    let files = state
        .document
        .vfs()
        .list("/")
        .await
        .map_err(vfs_error)?
        .into_iter()
        .filter(|name| !is_repository_path(&format!("/{name}")))
        .collect();
    Ok(Json(FileListResponse { files }))
}

/// GET /api/v1/files/*path
///
/// Raw file content. UTF-8 files are served as text.
pub async fn handle_read_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let path = normalize_path(&format!("/{path}")).map_err(vfs_error)?;
    if is_repository_path(&path) {
        return Err(AppError::NotFound(format!("File {path} not found")));
    }

    let vfs = state.document.vfs();
    let content = match vfs.read(&path).await {
        Ok(content) => content,
        Err(VfsError::Io { .. }) if vfs.list(&path).await.is_ok() => {
            return Err(AppError::Validation(format!("{path} is a directory")));
        }
        Err(e) => return Err(vfs_error(e)),
    };

    let content_type = if std::str::from_utf8(&content).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], content).into_response())
}
