//! Persistent session registry.
//!
//! A flat `KEY=value` file (`~/.remotecode/local`) holding the active
//! selection: session id, working directory, model, last chat id, and the
//! auto-sync toggle. Writes are whole-file: read lines, drop any with the
//! target key prefix, append the new line, write back. The orchestrator is
//! the only writer, so no cross-process locking is attempted.

use std::path::{Path, PathBuf};

use crate::store::SessionId;

const AGENT_NAME: &str = "CLAUDE";

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Raw key/value layer
    // ------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Option<String> {
        let body = tokio::fs::read_to_string(&self.path).await.ok()?;
        let prefix = format!("{key}=");
        body.lines()
            .rev()
            .find_map(|line| line.strip_prefix(&prefix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub async fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .unwrap_or_default();
        let prefix = format!("{key}=");
        let mut lines: Vec<String> = body
            .lines()
            .filter(|line| !line.starts_with(&prefix) && !line.trim().is_empty())
            .map(String::from)
            .collect();
        lines.push(format!("{key}={value}"));
        tokio::fs::write(&self.path, lines.join("\n") + "\n").await
    }

    pub async fn remove(&self, key: &str) -> std::io::Result<()> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .unwrap_or_default();
        let prefix = format!("{key}=");
        let lines: Vec<String> = body
            .lines()
            .filter(|line| !line.starts_with(&prefix) && !line.trim().is_empty())
            .map(String::from)
            .collect();
        tokio::fs::write(&self.path, lines.join("\n") + "\n").await
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub async fn active_session(&self) -> Option<SessionId> {
        let raw = self.get(&format!("REMOTECODE_SESSION_{AGENT_NAME}")).await?;
        SessionId::parse(&raw)
    }

    pub async fn set_active_session(&self, id: SessionId) -> std::io::Result<()> {
        self.set(&format!("REMOTECODE_SESSION_{AGENT_NAME}"), &id.to_string())
            .await
    }

    pub async fn active_cwd(&self) -> Option<PathBuf> {
        self.get(&format!("REMOTECODE_SESSION_{AGENT_NAME}_CWD"))
            .await
            .map(PathBuf::from)
    }

    pub async fn set_active_cwd(&self, cwd: &Path) -> std::io::Result<()> {
        self.set(
            &format!("REMOTECODE_SESSION_{AGENT_NAME}_CWD"),
            &cwd.to_string_lossy(),
        )
        .await
    }

    pub async fn model(&self) -> Option<String> {
        self.get("REMOTECODE_MODEL").await
    }

    pub async fn set_model(&self, model: &str) -> std::io::Result<()> {
        self.set("REMOTECODE_MODEL", model).await
    }

    pub async fn chat_id(&self) -> Option<i64> {
        self.get("REMOTECODE_CHAT_ID").await?.parse().ok()
    }

    pub async fn set_chat_id(&self, chat_id: i64) -> std::io::Result<()> {
        self.set("REMOTECODE_CHAT_ID", &chat_id.to_string()).await
    }

    pub async fn auto_sync(&self) -> bool {
        self.get("REMOTECODE_AUTO_SYNC")
            .await
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
    }

    pub async fn set_auto_sync(&self, on: bool) -> std::io::Result<()> {
        self.set("REMOTECODE_AUTO_SYNC", if on { "on" } else { "off" })
            .await
    }
}
