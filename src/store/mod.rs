//! Read-only view of the conversation tree.
//!
//! The external agent persists each session as
//! `<claude-dir>/projects/<encoded-dir>/<session-id>.jsonl`. This module
//! indexes that tree: project and session enumeration, tolerant record
//! parsing, tail scans for permission detection, and short-id lookup. The
//! bridge never writes here.

pub mod encoding;
pub mod records;
pub mod tail;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use encoding::{decode_project_dir, encode_working_dir};
pub use records::{one_line_preview, parse_records, ContentBlock, Record, RecordKind};
pub use tail::{
    fold_pending, last_user_input, pending_tool_uses, read_from_offset, read_tail_records,
    PendingToolUse,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a session file name: {0}")]
    BadSessionFile(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How many recent sessions the short-id lookup scans before falling back to
/// a full filesystem walk.
const RECENT_INDEX_SIZE: usize = 50;

/// Minimum prefix length for the full-tree fallback lookup.
const MIN_DEEP_PREFIX: usize = 8;

// ============================================================================
// Identifiers
// ============================================================================

/// Session identifier: a UUID, rendered in the usual 36-character form that
/// also names the on-disk record file.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// First 8 hex characters, for compact display.
    pub fn short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Enumeration types
// ============================================================================

#[derive(Clone, Debug)]
pub struct ProjectInfo {
    pub encoded: String,
    pub path: PathBuf,
    pub session_count: usize,
    pub last_modified: SystemTime,
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: SessionId,
    pub encoded_project: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

// ============================================================================
// Store
// ============================================================================

/// Read-only index over the conversation tree.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    claude_dir: PathBuf,
}

impl ConversationStore {
    pub fn new(claude_dir: impl Into<PathBuf>) -> Self {
        Self {
            claude_dir: claude_dir.into(),
        }
    }

    /// Store rooted at `~/.claude`.
    pub fn default_root() -> Self {
        Self::new(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude"),
        )
    }

    pub fn claude_dir(&self) -> PathBuf {
        self.claude_dir.clone()
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }

    pub fn project_dir(&self, encoded: &str) -> PathBuf {
        self.projects_dir().join(encoded)
    }

    pub fn session_path(&self, encoded_project: &str, id: SessionId) -> PathBuf {
        self.project_dir(encoded_project).join(format!("{id}.jsonl"))
    }

    /// Session file path for a working directory, whether or not it exists.
    pub fn session_path_for_cwd(&self, cwd: &Path, id: SessionId) -> PathBuf {
        self.session_path(&encode_working_dir(cwd), id)
    }

    /// Enumerate projects with session counts, newest first.
    pub async fn list_projects(&self) -> Vec<ProjectInfo> {
        let mut projects = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.projects_dir()).await else {
            return projects;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let encoded = entry.file_name().to_string_lossy().to_string();
            let sessions = self.project_sessions(&encoded, usize::MAX).await;
            if sessions.is_empty() {
                continue;
            }
            let last_modified = sessions
                .iter()
                .map(|s| s.modified)
                .max()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            projects.push(ProjectInfo {
                path: decode_project_dir(&encoded),
                encoded,
                session_count: sessions.len(),
                last_modified,
            });
        }

        projects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        projects
    }

    /// Sessions in one project, file mtime descending.
    pub async fn project_sessions(&self, encoded: &str, limit: usize) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.project_dir(encoded)).await else {
            return sessions;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(SessionId::parse)
            else {
                continue;
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            sessions.push(SessionInfo {
                id,
                encoded_project: encoded.to_string(),
                path,
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            });
        }

        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        sessions.truncate(limit);
        sessions
    }

    /// Most recent sessions across every project. Project directories are
    /// scanned concurrently; the tree is typically shallow but wide.
    pub async fn recent_sessions(&self, limit: usize) -> Vec<SessionInfo> {
        let mut projects = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.projects_dir()).await else {
            return Vec::new();
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                projects.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        let scans = projects
            .iter()
            .map(|encoded| self.project_sessions(encoded, usize::MAX));
        let mut all: Vec<SessionInfo> = join_all(scans).await.into_iter().flatten().collect();
        all.sort_by(|a, b| b.modified.cmp(&a.modified));
        all.truncate(limit);
        all
    }

    /// Locate a session file by exact id anywhere in the tree.
    pub async fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        let name = format!("{id}.jsonl");
        let Ok(mut entries) = tokio::fs::read_dir(self.projects_dir()).await else {
            return None;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let candidate = entry.path().join(&name);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                return Some(SessionInfo {
                    id,
                    encoded_project: entry.file_name().to_string_lossy().to_string(),
                    path: candidate,
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    size: meta.len(),
                });
            }
        }
        None
    }

    /// Find a session by short id prefix: first in the recent-N index, then
    /// (for prefixes of at least [`MIN_DEEP_PREFIX`] chars) in the whole
    /// tree.
    pub async fn find_session(&self, prefix: &str) -> Option<SessionInfo> {
        let prefix = prefix.to_ascii_lowercase();
        if prefix.is_empty() {
            return None;
        }

        for session in self.recent_sessions(RECENT_INDEX_SIZE).await {
            if session.id.to_string().starts_with(&prefix) {
                return Some(session);
            }
        }

        if prefix.len() < MIN_DEEP_PREFIX {
            return None;
        }

        let Ok(mut projects) = tokio::fs::read_dir(self.projects_dir()).await else {
            return None;
        };
        while let Ok(Some(project)) = projects.next_entry().await {
            let encoded = project.file_name().to_string_lossy().to_string();
            for session in self.project_sessions(&encoded, usize::MAX).await {
                if session.id.to_string().starts_with(&prefix) {
                    return Some(session);
                }
            }
        }
        None
    }

    /// Parse a whole session file; missing file yields an empty list.
    pub async fn read_records(&self, path: &Path) -> Vec<Record> {
        match tokio::fs::read_to_string(path).await {
            Ok(body) => parse_records(&body),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "session file unreadable");
                Vec::new()
            }
        }
    }

    /// First real user text in the file, truncated to a one-line preview.
    pub async fn first_user_preview(&self, path: &Path) -> Option<String> {
        let records = self.read_records(path).await;
        records
            .iter()
            .find(|r| r.is_real_user_text())
            .and_then(Record::text)
            .map(|t| one_line_preview(&t, 48))
    }

    /// Current size of a session file; 0 when absent.
    pub async fn file_size(&self, path: &Path) -> u64 {
        tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    }
}
