//! Conversation transcript: chat messages interleaved with checkpoint markers.
//!
//! Persisted as JSON inside the document's store but outside version control,
//! so restoring a checkpoint never rewrites the transcript behind our back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DocumentError;
use crate::vfs::Vfs;

pub const TRANSCRIPT_PATH: &str = "/.session/transcript.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Message {
        id: Uuid,
        role: Role,
        parts: Vec<MessagePart>,
        created_at: DateTime<Utc>,
    },
    Checkpoint {
        id: String,
        created_at: DateTime<Utc>,
    },
}

impl TranscriptEntry {
    pub fn message(role: Role, parts: Vec<MessagePart>) -> Self {
        TranscriptEntry::Message {
            id: Uuid::new_v4(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::message(role, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn checkpoint_id(&self) -> Option<&str> {
        match self {
            TranscriptEntry::Checkpoint { id, .. } => Some(id),
            TranscriptEntry::Message { .. } => None,
        }
    }
}

pub struct Transcript {
    vfs: Vfs,
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl Transcript {
    pub fn new(vfs: Vfs) -> Self {
        Self {
            vfs,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Reloads the persisted log. A missing file is an empty log; an unreadable
    /// one is logged and replaced on the next write.
    pub async fn load(&self) -> Result<(), DocumentError> {
        let loaded = match self.vfs.read_optional(TRANSCRIPT_PATH).await? {
            Some(raw) => match serde_json::from_slice::<Vec<TranscriptEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Discarding unreadable transcript: {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        debug!("Loaded transcript with {} entries", loaded.len());
        *self.entries.lock().await = loaded;
        Ok(())
    }

    async fn persist(&self, entries: &[TranscriptEntry]) -> Result<(), DocumentError> {
        let encoded = serde_json::to_vec(entries)?;
        self.vfs.write(TRANSCRIPT_PATH, encoded).await?;
        Ok(())
    }

    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn append(&self, entry: TranscriptEntry) -> Result<(), DocumentError> {
        let mut entries = self.entries.lock().await;
        entries.push(entry);
        if let Err(e) = self.persist(&entries).await {
            entries.pop();
            return Err(e);
        }
        Ok(())
    }

    pub async fn append_message(
        &self,
        role: Role,
        parts: Vec<MessagePart>,
    ) -> Result<(), DocumentError> {
        self.append(TranscriptEntry::message(role, parts)).await
    }

    pub async fn append_checkpoint(&self, id: &str) -> Result<(), DocumentError> {
        self.append(TranscriptEntry::Checkpoint {
            id: id.to_string(),
            created_at: Utc::now(),
        })
        .await
    }

    /// Drops every entry after the last marker for `id`. Returns how many
    /// entries were removed, or `None` (log untouched) when no marker matches.
    pub async fn truncate_after_checkpoint(&self, id: &str) -> Result<Option<usize>, DocumentError> {
        let mut entries = self.entries.lock().await;
        let Some(position) = entries
            .iter()
            .rposition(|entry| entry.checkpoint_id() == Some(id))
        else {
            return Ok(None);
        };

        let removed = entries.split_off(position + 1);
        if removed.is_empty() {
            return Ok(Some(0));
        }
        if let Err(e) = self.persist(&entries).await {
            entries.extend(removed);
            return Err(e);
        }
        Ok(Some(removed.len()))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::DiskBackend;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn transcript() -> (Transcript, Vfs, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(DiskBackend::open(dir.path(), "transcript").await.unwrap());
        (Transcript::new(vfs.clone()), vfs, dir)
    }

    fn roles_and_markers(entries: &[TranscriptEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| match entry {
                TranscriptEntry::Message { role, .. } => format!("{role:?}"),
                TranscriptEntry::Checkpoint { id, .. } => id.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_truncate_keeps_entries_up_to_marker() {
        let (log, _, _dir) = transcript().await;
        log.append(TranscriptEntry::text(Role::User, "hi")).await.unwrap();
        log.append_checkpoint("c1").await.unwrap();
        log.append(TranscriptEntry::text(Role::Assistant, "done")).await.unwrap();
        log.append_checkpoint("c2").await.unwrap();

        assert_eq!(log.truncate_after_checkpoint("c1").await.unwrap(), Some(2));
        assert_eq!(
            roles_and_markers(&log.entries().await),
            vec!["User".to_string(), "c1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_truncate_uses_last_matching_marker() {
        let (log, _, _dir) = transcript().await;
        log.append_checkpoint("c1").await.unwrap();
        log.append(TranscriptEntry::text(Role::User, "a")).await.unwrap();
        log.append_checkpoint("c1").await.unwrap();
        log.append(TranscriptEntry::text(Role::User, "b")).await.unwrap();

        assert_eq!(log.truncate_after_checkpoint("c1").await.unwrap(), Some(1));
        assert_eq!(log.entries().await.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_marker_leaves_log_untouched() {
        let (log, _, _dir) = transcript().await;
        log.append(TranscriptEntry::text(Role::User, "hi")).await.unwrap();
        assert_eq!(log.truncate_after_checkpoint("nope").await.unwrap(), None);
        assert_eq!(log.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reload() {
        let (log, vfs, _dir) = transcript().await;
        log.append_message(
            Role::Assistant,
            vec![MessagePart::ToolCall {
                id: "t1".to_string(),
                name: "query".to_string(),
                input: serde_json::json!({"query": ".personal"}),
            }],
        )
        .await
        .unwrap();
        log.append_checkpoint("c1").await.unwrap();

        let reloaded = Transcript::new(vfs);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.entries().await, log.entries().await);
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let (log, vfs, _dir) = transcript().await;
        vfs.write(TRANSCRIPT_PATH, "{not json").await.unwrap();
        log.load().await.unwrap();
        assert!(log.entries().await.is_empty());
    }
}
