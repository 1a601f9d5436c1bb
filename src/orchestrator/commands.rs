//! Chat command surface.
//!
//! Static commands plus the synthesized `/show_sessions_<name>` and
//! `/switch_to_<prefix>` forms derived from discovered projects and
//! sessions.

use std::time::Duration;

use super::{Orchestrator, QueuedTurn};
use crate::store::SessionId;
use crate::telegram::{ChatId, InlineKeyboard, OutgoingMessage};

const HELP: &str = "remotecode — chat bridge to your local coding agent\n\n\
/sessions — recent sessions\n\
/projects — projects with sessions\n\
/new — start a fresh session\n\
/history — recent messages of the active session\n\
/model — choose the model\n\
/resume <prefix> — switch by session id prefix\n\
/cancel — stop the current turn\n\
/sync — toggle mirroring of host-side activity\n\n\
Anything else you type goes straight to the agent.";

const MODELS: &[&str] = &["default", "opus", "sonnet", "haiku"];

const CANCEL_MUTE: Duration = Duration::from_secs(3);

const WRAP_UP_PROMPT: &str = "The user cancelled the current task. Stop what you are doing, \
                              finish any half-written edit, and leave the workspace clean.";

impl Orchestrator {
    pub(crate) async fn handle_command(&self, chat_id: ChatId, text: &str) {
        let mut parts = text.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default();
        let arg = parts.next().unwrap_or("").trim();
        // Allow the /command@botname form Telegram uses in groups.
        let name = head
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or_default();

        match name {
            "start" | "help" => self.notify(chat_id, HELP).await,
            "sessions" => self.list_sessions(chat_id).await,
            "projects" => self.list_projects(chat_id).await,
            "new" => self.new_session(chat_id, None).await,
            "history" => self.show_history(chat_id).await,
            "model" => self.show_models(chat_id).await,
            "resume" => {
                if arg.is_empty() {
                    self.list_sessions(chat_id).await;
                } else {
                    self.switch_by_prefix(chat_id, arg).await;
                }
            }
            "cancel" => self.cancel_active(chat_id).await,
            "sync" => self.toggle_sync(chat_id).await,
            other => {
                if let Some(slug) = other.strip_prefix("show_sessions_") {
                    self.show_sessions_by_slug(chat_id, slug).await;
                } else if let Some(prefix) = other.strip_prefix("switch_to_") {
                    self.switch_by_prefix(chat_id, prefix).await;
                } else {
                    self.notify(chat_id, "Unknown command. /help lists what I understand.")
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    async fn list_sessions(&self, chat_id: ChatId) {
        let sessions = self.store.recent_sessions(10).await;
        if sessions.is_empty() {
            self.notify(chat_id, "No sessions yet. Just send a message to start one.")
                .await;
            return;
        }

        let mut keyboard = InlineKeyboard::new();
        for info in &sessions {
            let preview = self
                .store
                .first_user_preview(&info.path)
                .await
                .unwrap_or_else(|| "(empty)".to_string());
            keyboard = keyboard.row(vec![InlineKeyboard::button(
                format!("{} — {preview}", info.id.short()),
                format!("sess:{}", info.id),
            )]);
        }

        let message =
            OutgoingMessage::text(chat_id, "Recent sessions — tap to switch:").keyboard(keyboard);
        if let Err(err) = self.chat.send_message(message).await {
            tracing::warn!(error = %err, "sessions list send failed");
        }
    }

    async fn list_projects(&self, chat_id: ChatId) {
        let projects = self.store.list_projects().await;
        if projects.is_empty() {
            self.notify(chat_id, "No projects found.").await;
            return;
        }

        let mut keyboard = InlineKeyboard::new();
        let mut lines = vec!["Projects:".to_string()];
        for project in &projects {
            lines.push(format!(
                "📁 {} ({} sessions) — /show_sessions_{}",
                project.path.display(),
                project.session_count,
                command_slug(&project.path),
            ));
            keyboard = keyboard.row(vec![InlineKeyboard::button(
                project.path.display().to_string(),
                format!("proj:{}", project.encoded),
            )]);
        }

        let message = OutgoingMessage::text(chat_id, lines.join("\n")).keyboard(keyboard);
        if let Err(err) = self.chat.send_message(message).await {
            tracing::warn!(error = %err, "projects list send failed");
        }
    }

    pub(crate) async fn show_project_sessions(&self, chat_id: ChatId, encoded: &str) {
        let sessions = self.store.project_sessions(encoded, 10).await;
        let mut keyboard = InlineKeyboard::new();
        for info in &sessions {
            let preview = self
                .store
                .first_user_preview(&info.path)
                .await
                .unwrap_or_else(|| "(empty)".to_string());
            keyboard = keyboard.row(vec![
                InlineKeyboard::button(
                    format!("{} — {preview}", info.id.short()),
                    format!("sess:{}", info.id),
                ),
                InlineKeyboard::button("🗑", format!("sessdel:{}", info.id)),
            ]);
        }
        keyboard = keyboard.row(vec![InlineKeyboard::button(
            "➕ New session here",
            format!("newsess:{encoded}"),
        )]);

        let project = crate::store::decode_project_dir(encoded);
        let message = OutgoingMessage::text(chat_id, format!("Sessions in {}:", project.display()))
            .keyboard(keyboard);
        if let Err(err) = self.chat.send_message(message).await {
            tracing::warn!(error = %err, "project sessions send failed");
        }
    }

    async fn show_sessions_by_slug(&self, chat_id: ChatId, slug: &str) {
        for project in self.store.list_projects().await {
            if command_slug(&project.path) == slug {
                self.show_project_sessions(chat_id, &project.encoded).await;
                return;
            }
        }
        self.notify(chat_id, "No project matches that name.").await;
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    async fn new_session(&self, chat_id: ChatId, cwd: Option<std::path::PathBuf>) {
        let session = SessionId::new();
        if let Some(cwd) = cwd {
            if let Err(err) = self.registry.set_active_cwd(&cwd).await {
                tracing::warn!(error = %err, "cwd save failed");
            }
        }
        if let Err(err) = self.registry.set_active_session(session).await {
            tracing::warn!(error = %err, "session save failed");
        }
        self.flags.set_suppressed(session, false);

        let cwd = self
            .registry
            .active_cwd()
            .await
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        self.notify(
            chat_id,
            &format!("✨ New session {} in {}", session.short(), cwd.display()),
        )
        .await;
    }

    pub(crate) async fn new_session_in_project(&self, chat_id: ChatId, encoded: &str) {
        let cwd = crate::store::decode_project_dir(encoded);
        self.new_session(chat_id, Some(cwd)).await;
    }

    pub(crate) async fn delete_session(&self, chat_id: ChatId, session: SessionId) {
        let Some(info) = self.store.session_info(session).await else {
            self.notify(chat_id, "Session file not found.").await;
            return;
        };
        if let Some(channel) = self.channels.remove(session) {
            channel.close().await;
        }
        match tokio::fs::remove_file(&info.path).await {
            Ok(()) => {
                self.notify(chat_id, &format!("🗑 Deleted session {}", session.short()))
                    .await;
            }
            Err(err) => {
                self.notify(chat_id, &format!("⚠️ Delete failed: {err}")).await;
            }
        }
    }

    async fn switch_by_prefix(&self, chat_id: ChatId, prefix: &str) {
        match self.store.find_session(prefix).await {
            Some(info) => self.switch_to(chat_id, info.id).await,
            None => {
                self.notify(
                    chat_id,
                    "No session with that prefix. Prefixes shorter than 8 characters only \
                     search recent sessions.",
                )
                .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // History / model / sync
    // ------------------------------------------------------------------

    async fn show_history(&self, chat_id: ChatId) {
        let Some(session) = self.registry.active_session().await else {
            self.notify(chat_id, "No active session.").await;
            return;
        };
        let Some(info) = self.store.session_info(session).await else {
            self.notify(chat_id, "The active session has no file yet.").await;
            return;
        };

        let records = self.store.read_records(&info.path).await;
        let mut lines = Vec::new();
        for record in &records {
            if record.has_tool_use_block() || record.has_tool_result_block() {
                continue;
            }
            let label = match record.kind {
                crate::store::RecordKind::User if record.is_real_user_text() => "You",
                crate::store::RecordKind::Assistant => "Bot",
                _ => continue,
            };
            if let Some(text) = record.text() {
                let stamp = record
                    .timestamp
                    .map(|t| format!("[{}] ", t.format("%H:%M")))
                    .unwrap_or_default();
                lines.push(format!(
                    "{stamp}{label}: {}",
                    crate::store::one_line_preview(&text, 200)
                ));
            }
        }

        let recent: Vec<String> = lines.into_iter().rev().take(10).rev().collect();
        if recent.is_empty() {
            self.notify(chat_id, "History is empty.").await;
        } else {
            self.notify(chat_id, &recent.join("\n")).await;
        }
    }

    async fn show_models(&self, chat_id: ChatId) {
        let current = self
            .registry
            .model()
            .await
            .unwrap_or_else(|| "default".to_string());
        let mut keyboard = InlineKeyboard::new();
        for model in MODELS {
            let label = if *model == current {
                format!("• {model}")
            } else {
                (*model).to_string()
            };
            keyboard = keyboard.row(vec![InlineKeyboard::button(label, format!("model:{model}"))]);
        }
        let message = OutgoingMessage::text(chat_id, "Pick a model:").keyboard(keyboard);
        if let Err(err) = self.chat.send_message(message).await {
            tracing::warn!(error = %err, "model list send failed");
        }
    }

    async fn toggle_sync(&self, chat_id: ChatId) {
        let next = !self.registry.auto_sync().await;
        if let Err(err) = self.registry.set_auto_sync(next).await {
            tracing::warn!(error = %err, "auto-sync save failed");
        }
        let state = if next { "on" } else { "off" };
        self.notify(chat_id, &format!("🔁 Auto-sync is now {state}.")).await;
    }

    // ------------------------------------------------------------------
    // Cancel
    // ------------------------------------------------------------------

    pub(crate) async fn cancel_active(&self, chat_id: ChatId) {
        let Some(session) = self.registry.active_session().await else {
            self.notify(chat_id, "Nothing to cancel.").await;
            return;
        };

        // Dialogs resolve as deny and the latch blocks the rest of the
        // stream's callbacks.
        self.arbiter.deny_all(session);
        let dropped = self.queues.clear(session);
        if dropped > 0 {
            tracing::debug!(dropped, "queued turns dropped by cancel");
        }

        // Mute the tail of the interrupted stream, not its permissions.
        self.flags.set_muted(session, true);
        {
            let flags = self.flags.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CANCEL_MUTE).await;
                flags.set_muted(session, false);
            });
        }

        let busy = match self.channels.get(session) {
            Some(channel) => {
                channel.interrupt().await;
                true
            }
            None => false,
        };

        self.notify(chat_id, "🛑 Task cancelled.").await;

        // Ask the agent to tidy up; delivery is best-effort and silent.
        if busy {
            let turn = QueuedTurn::prompt(WRAP_UP_PROMPT).quiet();
            if self.queues.enqueue(session, turn).is_err() {
                tracing::debug!("wrap-up prompt dropped, queue full");
            }
        }
    }
}

/// Command-safe slug for a project path: the final component, lowercased,
/// with anything outside `[a-z0-9_]` folded to `_`.
pub(crate) fn command_slug(path: &std::path::Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_command_slug() {
        assert_eq!(command_slug(Path::new("/home/u/My-App")), "my_app");
        assert_eq!(command_slug(Path::new("/home/u/proj.rs")), "proj_rs");
        assert_eq!(command_slug(Path::new("/")), "root");
    }
}
