//! Global pending-permission scanner.
//!
//! Every 10 s the scanner sweeps recently modified session files across all
//! projects and surfaces pending tool permissions for sessions the watcher
//! is *not* covering (everything except the active selection). Each
//! qualifying session gets one chat notification with a takeover button;
//! the notification lifecycle (resolve, expire, dismiss) is re-evaluated on
//! every tick. The takeover flow itself is behind [`TakeoverHandler`],
//! injected at construction — the scanner never reaches into the
//! orchestrator directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;

use crate::registry::SessionRegistry;
use crate::state::SessionFlags;
use crate::store::{
    last_user_input, one_line_preview, pending_tool_uses, ConversationStore, SessionId,
};
use crate::telegram::{ChatTransport, InlineKeyboard, OutgoingMessage};

const SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Only files touched this recently are considered.
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Skip files younger than this to avoid racing a write in progress.
const SETTLE_WINDOW: Duration = Duration::from_secs(30);
const SCAN_LIMIT: usize = 100;

/// Hands a background session over to the chat: activate it and resubmit
/// its last prompt through the interactive permission flow.
#[async_trait]
pub trait TakeoverHandler: Send + Sync {
    async fn take_over(&self, session: SessionId);
}

struct Notification {
    chat_id: i64,
    message_id: i64,
    body: String,
}

pub struct Scanner {
    store: ConversationStore,
    registry: Arc<SessionRegistry>,
    chat: Arc<dyn ChatTransport>,
    flags: Arc<SessionFlags>,
    takeover: Arc<dyn TakeoverHandler>,
    notified: DashMap<SessionId, Notification>,
    dismissed: DashSet<SessionId>,
    continued: DashSet<SessionId>,
}

impl Scanner {
    pub fn new(
        store: ConversationStore,
        registry: Arc<SessionRegistry>,
        chat: Arc<dyn ChatTransport>,
        flags: Arc<SessionFlags>,
        takeover: Arc<dyn TakeoverHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            chat,
            flags,
            takeover,
            notified: DashMap::new(),
            dismissed: DashSet::new(),
            continued: DashSet::new(),
        })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCAN_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// One sweep; public so tests can drive it without the timer.
    pub async fn tick(&self) {
        let now = SystemTime::now();
        let active = self.registry.active_session().await;
        let recent = self.store.recent_sessions(SCAN_LIMIT).await;

        let mut seen_recent = Vec::with_capacity(recent.len());
        for info in &recent {
            let age = now
                .duration_since(info.modified)
                .unwrap_or(Duration::ZERO);
            if age > RECENT_WINDOW {
                continue;
            }
            seen_recent.push(info.id);

            if Some(info.id) == active {
                continue;
            }
            if self.flags.has_active_query(info.id) {
                continue;
            }
            if age < SETTLE_WINDOW {
                continue;
            }

            let pending = pending_tool_uses(&info.path).await.unwrap_or_default();
            if pending.is_empty() {
                // Resolved naturally: clear the dismiss bit and annotate any
                // standing notification.
                self.dismissed.remove(&info.id);
                self.continued.remove(&info.id);
                if let Some((_, notification)) = self.notified.remove(&info.id) {
                    let body = format!("{}\n✓ Resolved", notification.body);
                    let _ = self
                        .chat
                        .edit_message(notification.chat_id, notification.message_id, &body, None)
                        .await;
                }
                continue;
            }

            if self.notified.contains_key(&info.id)
                || self.dismissed.contains(&info.id)
                || self.continued.contains(&info.id)
            {
                continue;
            }

            self.post_notification(info.id, &info.path, &info.encoded_project, &pending)
                .await;
        }

        // Notifications whose file fell out of the recent window are gone.
        let stale: Vec<SessionId> = self
            .notified
            .iter()
            .filter(|entry| !seen_recent.contains(entry.key()))
            .map(|entry| *entry.key())
            .collect();
        for session in stale {
            if let Some((_, notification)) = self.notified.remove(&session) {
                let _ = self
                    .chat
                    .delete_message(notification.chat_id, notification.message_id)
                    .await;
            }
        }
    }

    async fn post_notification(
        &self,
        session: SessionId,
        path: &std::path::Path,
        encoded_project: &str,
        pending: &[crate::store::PendingToolUse],
    ) {
        let Some(chat_id) = self.registry.chat_id().await else {
            return;
        };

        let project = crate::store::decode_project_dir(encoded_project);
        let snippet = last_user_input(path)
            .await
            .ok()
            .flatten()
            .map(|text| one_line_preview(&text, 64))
            .unwrap_or_default();

        let mut body = format!(
            "⏳ Permission pending in another session\n📁 {}",
            project.display()
        );
        if !snippet.is_empty() {
            body.push_str(&format!("\n💬 {snippet}"));
        }
        if let Some(first) = pending.first() {
            body.push_str(&format!("\n🔧 {}", first.descriptor()));
        }

        let keyboard = InlineKeyboard::new().row(vec![
            InlineKeyboard::button("▶️ Continue in Telegram", format!("takeover:{session}")),
            InlineKeyboard::button("✖️ Dismiss", format!("dismiss:{session}")),
        ]);

        match self
            .chat
            .send_message(OutgoingMessage::text(chat_id, body.clone()).keyboard(keyboard))
            .await
        {
            Ok(message_id) => {
                self.notified.insert(
                    session,
                    Notification {
                        chat_id,
                        message_id,
                        body,
                    },
                );
            }
            Err(err) => {
                tracing::debug!(error = %err, "scanner notification send failed");
            }
        }
    }

    /// Takeover button: annotate the notification, remember the choice, and
    /// run the handoff.
    pub async fn continue_in_chat(&self, session: SessionId) {
        self.continued.insert(session);
        if let Some(notification) = self.notified.get(&session) {
            let body = format!("{}\n→ Continuing in Telegram", notification.body);
            let _ = self
                .chat
                .edit_message(notification.chat_id, notification.message_id, &body, None)
                .await;
        }
        self.takeover.take_over(session).await;
    }

    /// Dismiss button: drop the notification and stay quiet until the
    /// pending set resolves and re-appears.
    pub async fn dismiss(&self, session: SessionId) {
        self.dismissed.insert(session);
        if let Some((_, notification)) = self.notified.remove(&session) {
            let _ = self
                .chat
                .delete_message(notification.chat_id, notification.message_id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChat;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTakeover {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TakeoverHandler for RecordingTakeover {
        async fn take_over(&self, _session: SessionId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        scanner: Arc<Scanner>,
        chat: Arc<MockChat>,
        takeover: Arc<RecordingTakeover>,
        root: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("claude");
        let store = ConversationStore::new(&root);
        let registry = Arc::new(SessionRegistry::new(dir.path().join("local")));
        registry.set_chat_id(1).await.unwrap();
        let chat = Arc::new(MockChat::new());
        let takeover = Arc::new(RecordingTakeover {
            calls: AtomicUsize::new(0),
        });
        let scanner = Scanner::new(
            store,
            registry,
            chat.clone(),
            SessionFlags::new(),
            takeover.clone(),
        );
        Fixture {
            _dir: dir,
            scanner,
            chat,
            takeover,
            root,
        }
    }

    fn seed_pending_session(root: &std::path::Path, session: SessionId, age: Duration) {
        let project = root.join("projects/-work-proj");
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join(format!("{session}.jsonl"));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","message":{{"role":"user","content":"deploy it"}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"tu_1","name":"Bash","input":{{"command":"make deploy"}}}}]}}}}"#
        )
        .unwrap();
        drop(file);
        let mtime = SystemTime::now() - age;
        std::fs::File::open(&path).unwrap().set_modified(mtime).unwrap();
    }

    #[tokio::test]
    async fn test_notifies_for_settled_pending_session() {
        let fx = fixture().await;
        let session = SessionId::new();
        seed_pending_session(&fx.root, session, Duration::from_secs(60));

        fx.scanner.tick().await;

        let notification = fx.chat.find_dialog("takeover:").unwrap();
        assert!(notification.text.contains("Permission pending in another session"));
        assert!(notification.text.contains("deploy it"));
        assert!(notification.text.contains("make deploy"));

        // Second tick: no duplicate.
        fx.scanner.tick().await;
        assert_eq!(fx.chat.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_write_not_raced() {
        let fx = fixture().await;
        let session = SessionId::new();
        seed_pending_session(&fx.root, session, Duration::from_secs(5));

        fx.scanner.tick().await;
        assert_eq!(fx.chat.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_continue_marks_and_invokes_takeover() {
        let fx = fixture().await;
        let session = SessionId::new();
        seed_pending_session(&fx.root, session, Duration::from_secs(60));
        fx.scanner.tick().await;
        let notification = fx.chat.find_dialog("takeover:").unwrap();

        fx.scanner.continue_in_chat(session).await;

        assert_eq!(fx.takeover.calls.load(Ordering::SeqCst), 1);
        let body = fx.chat.current_text(notification.message_id).unwrap();
        assert!(body.contains("Continuing in Telegram"));

        // No re-notify after a takeover.
        fx.scanner.tick().await;
        assert_eq!(fx.chat.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_dismiss_suppresses_until_resolution() {
        let fx = fixture().await;
        let session = SessionId::new();
        seed_pending_session(&fx.root, session, Duration::from_secs(60));
        fx.scanner.tick().await;

        fx.scanner.dismiss(session).await;
        assert_eq!(fx.chat.deleted_messages().len(), 1);

        fx.scanner.tick().await;
        assert_eq!(fx.chat.sent_count(), 1); // nothing new posted
    }

    #[tokio::test]
    async fn test_active_session_excluded() {
        let fx = fixture().await;
        let session = SessionId::new();
        seed_pending_session(&fx.root, session, Duration::from_secs(60));
        fx.scanner.registry.set_active_session(session).await.unwrap();

        fx.scanner.tick().await;
        assert_eq!(fx.chat.sent_count(), 0);
    }
}
