//! Active-session file watcher.
//!
//! One watcher instance tails the record file of the *currently selected*
//! session, re-binding when the registry's selection changes (3 s poll).
//! Filesystem notifications are debounced 500 ms, then the new tail is read
//! by byte offset and processed in two passes: a permission pass that
//! maintains the pending tool_use map and raises the "pending on host"
//! notification, and a display pass that forwards text turns when auto-sync
//! is on. The orchestrator's active-query marker guards against re-emitting
//! traffic the bridge itself produced; the offset still advances so nothing
//! replays later.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::registry::SessionRegistry;
use crate::state::{ChannelMap, SessionFlags};
use crate::store::{
    fold_pending, read_from_offset, ConversationStore, PendingToolUse, Record, RecordKind,
    SessionId,
};
use crate::telegram::{ChatTransport, InlineKeyboard, OutgoingMessage};

const REBIND_POLL: Duration = Duration::from_secs(3);
const TAIL_DEBOUNCE: Duration = Duration::from_millis(500);
const NOTIFY_DEBOUNCE: Duration = Duration::from_secs(8);
/// Park a deadline far in the future instead of carrying an Option.
const IDLE: Duration = Duration::from_secs(3600 * 24);

#[derive(Debug)]
pub enum WatcherCommand {
    /// Advance the byte offset to the current end of file and drop any
    /// pending debounce (the orchestrator just rendered this data itself).
    SkipToEnd(SessionId),
    /// Annotate the pending notification: the user is continuing here.
    MarkContinuing(SessionId),
    /// Suppress the pending notification until it resolves naturally.
    Dismiss(SessionId),
}

/// Cheap cloneable handle to the watcher task.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<WatcherCommand>,
}

impl WatcherHandle {
    pub fn skip_to_end(&self, session: SessionId) {
        let _ = self.tx.send(WatcherCommand::SkipToEnd(session));
    }

    pub fn mark_continuing(&self, session: SessionId) {
        let _ = self.tx.send(WatcherCommand::MarkContinuing(session));
    }

    pub fn dismiss(&self, session: SessionId) {
        let _ = self.tx.send(WatcherCommand::Dismiss(session));
    }
}

struct Notification {
    chat_id: i64,
    message_id: i64,
    body: String,
}

struct WatcherState {
    session: Option<SessionId>,
    path: Option<PathBuf>,
    offset: u64,
    pending: HashMap<String, PendingToolUse>,
    notification: Option<Notification>,
    dismissed: bool,
    tail_deadline: Instant,
    notify_deadline: Instant,
}

impl WatcherState {
    fn new() -> Self {
        let far = Instant::now() + IDLE;
        Self {
            session: None,
            path: None,
            offset: 0,
            pending: HashMap::new(),
            notification: None,
            dismissed: false,
            tail_deadline: far,
            notify_deadline: far,
        }
    }

    fn park_tail(&mut self) {
        self.tail_deadline = Instant::now() + IDLE;
    }

    fn park_notify(&mut self) {
        self.notify_deadline = Instant::now() + IDLE;
    }
}

pub struct SessionWatcher {
    store: ConversationStore,
    registry: Arc<SessionRegistry>,
    chat: Arc<dyn ChatTransport>,
    flags: Arc<SessionFlags>,
    channels: Arc<ChannelMap>,
}

impl SessionWatcher {
    pub fn new(
        store: ConversationStore,
        registry: Arc<SessionRegistry>,
        chat: Arc<dyn ChatTransport>,
        flags: Arc<SessionFlags>,
        channels: Arc<ChannelMap>,
    ) -> Self {
        Self {
            store,
            registry,
            chat,
            flags,
            channels,
        }
    }

    /// Create the command handle up front so the orchestrator can be built
    /// before the watcher task runs.
    pub fn handle() -> (WatcherHandle, mpsc::UnboundedReceiver<WatcherCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WatcherHandle { tx }, rx)
    }

    pub fn spawn(self, commands: mpsc::UnboundedReceiver<WatcherCommand>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(commands).await;
        })
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<WatcherCommand>) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<PathBuf>();
        // Keep the channel open even when the notify backend is gone, so
        // the recv branch pends instead of spinning on a closed channel.
        let _fs_tx_guard = fs_tx.clone();

        // The notify callback runs on its own thread; forward paths into the
        // task. The watcher object must stay alive for the task's lifetime.
        let _fs_watcher: Option<RecommendedWatcher> = match RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                    ) {
                        for path in event.paths {
                            let _ = fs_tx.send(path);
                        }
                    }
                }
            },
            notify::Config::default(),
        ) {
            Ok(mut watcher) => {
                let root = self.store.projects_dir();
                if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
                    tracing::warn!(error = %err, "projects tree watch failed, polling only");
                }
                Some(watcher)
            }
            Err(err) => {
                tracing::warn!(error = %err, "filesystem watcher unavailable, polling only");
                None
            }
        };

        let mut state = WatcherState::new();
        let mut rebind = tokio::time::interval(REBIND_POLL);

        loop {
            tokio::select! {
                _ = rebind.tick() => {
                    self.rebind_if_changed(&mut state).await;
                    // Poll fallback: a dropped notification must not stall
                    // the tail forever.
                    if let Some(ref path) = state.path {
                        if self.store.file_size(path).await > state.offset {
                            state.tail_deadline = Instant::now() + TAIL_DEBOUNCE;
                        }
                    }
                }
                Some(path) = fs_rx.recv() => {
                    if state.path.as_deref() == Some(path.as_path()) {
                        state.tail_deadline = Instant::now() + TAIL_DEBOUNCE;
                    }
                }
                _ = tokio::time::sleep_until(state.tail_deadline) => {
                    state.park_tail();
                    self.process_tail(&mut state).await;
                }
                _ = tokio::time::sleep_until(state.notify_deadline) => {
                    state.park_notify();
                    self.fire_pending_notification(&mut state).await;
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(&mut state, command).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn rebind_if_changed(&self, state: &mut WatcherState) {
        let selected = self.registry.active_session().await;
        if selected == state.session {
            return;
        }

        state.session = selected;
        state.pending.clear();
        state.notification = None;
        state.dismissed = false;
        state.park_tail();
        state.park_notify();

        match selected {
            Some(session) => match self.store.session_info(session).await {
                Some(info) => {
                    // Start tailing at the end: history belongs to /history,
                    // not the live feed.
                    state.offset = info.size;
                    state.path = Some(info.path);
                    tracing::debug!(session = %session, "watcher bound");
                }
                None => {
                    // File not written yet; tail from byte zero once it
                    // appears.
                    state.offset = 0;
                    let cwd = self.registry.active_cwd().await.unwrap_or_default();
                    state.path = Some(self.store.session_path_for_cwd(&cwd, session));
                }
            },
            None => {
                state.path = None;
                state.offset = 0;
            }
        }
    }

    async fn handle_command(&self, state: &mut WatcherState, command: WatcherCommand) {
        match command {
            WatcherCommand::SkipToEnd(session) => {
                if state.session == Some(session) {
                    if let Some(ref path) = state.path {
                        state.offset = self.store.file_size(path).await;
                    }
                    state.park_tail();
                    state.park_notify();
                }
            }
            WatcherCommand::MarkContinuing(session) => {
                if state.session == Some(session) {
                    if let Some(ref notification) = state.notification {
                        let body = format!("{}\n→ Continuing in Telegram", notification.body);
                        let _ = self
                            .chat
                            .edit_message(notification.chat_id, notification.message_id, &body, None)
                            .await;
                    }
                    state.park_notify();
                }
            }
            WatcherCommand::Dismiss(session) => {
                if state.session == Some(session) {
                    state.dismissed = true;
                    if let Some(notification) = state.notification.take() {
                        let _ = self
                            .chat
                            .delete_message(notification.chat_id, notification.message_id)
                            .await;
                    }
                    state.park_notify();
                }
            }
        }
    }

    async fn process_tail(&self, state: &mut WatcherState) {
        let (Some(session), Some(path)) = (state.session, state.path.clone()) else {
            return;
        };

        let (records, end) = match read_from_offset(&path, state.offset).await {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(error = %err, "tail read failed");
                return;
            }
        };
        // Offset advances even when processing is skipped, so the same
        // bytes never replay.
        state.offset = end;

        if records.is_empty() {
            return;
        }

        if self.flags.has_active_query(session) {
            // The orchestrator is streaming this data live.
            return;
        }

        // Third-party activity: the in-memory channel no longer matches the
        // file.
        self.channels.mark_stale(session);

        self.permission_pass(state, session, &records).await;

        if self.registry.auto_sync().await {
            self.display_pass(session, &records).await;
        }
    }

    async fn permission_pass(
        &self,
        state: &mut WatcherState,
        session: SessionId,
        records: &[Record],
    ) {
        let had_pending = !state.pending.is_empty();
        fold_pending(&mut state.pending, records);

        if state.pending.is_empty() {
            state.dismissed = false;
            state.park_notify();
            if let Some(notification) = state.notification.take() {
                let body = format!("{}\n✓ Resolved", notification.body);
                let _ = self
                    .chat
                    .edit_message(notification.chat_id, notification.message_id, &body, None)
                    .await;
            }
            return;
        }

        if self.flags.has_active_query(session) || state.dismissed {
            return;
        }
        if state.notification.is_none() && !had_pending {
            state.notify_deadline = Instant::now() + NOTIFY_DEBOUNCE;
        }
    }

    async fn fire_pending_notification(&self, state: &mut WatcherState) {
        let Some(session) = state.session else {
            return;
        };
        if state.pending.is_empty()
            || state.dismissed
            || state.notification.is_some()
            || self.flags.has_active_query(session)
        {
            return;
        }
        let Some(chat_id) = self.registry.chat_id().await else {
            return;
        };

        let first = state.pending.values().next();
        let mut body = "⏳ Permission pending on this host's session".to_string();
        if let Some(pending) = first {
            body.push('\n');
            body.push_str(&pending.descriptor());
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
                state.notification = Some(Notification {
                    chat_id,
                    message_id,
                    body,
                });
            }
            Err(err) => {
                tracing::debug!(error = %err, "pending notification send failed");
            }
        }
    }

    async fn display_pass(&self, _session: SessionId, records: &[Record]) {
        let Some(chat_id) = self.registry.chat_id().await else {
            return;
        };

        for record in records {
            // Tool plumbing never syncs; only typed conversation text does.
            if record.has_tool_use_block() || record.has_tool_result_block() {
                continue;
            }
            let label = match record.kind {
                RecordKind::User if record.is_real_user_text() => "[sync] You:",
                RecordKind::Assistant => "[sync] Bot:",
                _ => continue,
            };
            let Some(text) = record.text() else {
                continue;
            };
            let message = OutgoingMessage::text(chat_id, format!("{label} {text}"));
            if let Err(err) = self.chat.send_message(message).await {
                tracing::debug!(error = %err, "sync forward failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChat;
    use std::io::Write;

    fn fixture() -> (
        tempfile::TempDir,
        SessionWatcher,
        WatcherState,
        Arc<MockChat>,
        Arc<SessionFlags>,
        Arc<SessionRegistry>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("claude"));
        let registry = Arc::new(SessionRegistry::new(dir.path().join("local")));
        let chat = Arc::new(MockChat::new());
        let flags = SessionFlags::new();
        let channels = ChannelMap::new();
        let watcher = SessionWatcher::new(
            store,
            registry.clone(),
            chat.clone(),
            flags.clone(),
            channels,
        );
        (dir, watcher, WatcherState::new(), chat, flags, registry)
    }

    fn seed_file(dir: &tempfile::TempDir, session: SessionId, lines: &[String]) -> PathBuf {
        let project = dir.path().join("claude/projects/-p");
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join(format!("{session}.jsonl"));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn tool_use_line(id: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"{id}","name":"Bash","input":{{"command":"make"}}}}]}}}}"#
        )
    }

    fn user_line(text: &str) -> String {
        format!(r#"{{"type":"user","message":{{"role":"user","content":"{text}"}}}}"#)
    }

    fn assistant_line(text: &str) -> String {
        format!(r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"text","text":"{text}"}}]}}}}"#)
    }

    #[tokio::test]
    async fn test_active_query_guard_advances_offset_without_output() {
        let (dir, watcher, mut state, chat, flags, registry) = fixture();
        let session = SessionId::new();
        registry.set_auto_sync(true).await.unwrap();
        registry.set_chat_id(1).await.unwrap();
        let path = seed_file(&dir, session, &[assistant_line("self traffic")]);

        state.session = Some(session);
        state.path = Some(path.clone());
        state.offset = 0;
        flags.begin_query(session);

        watcher.process_tail(&mut state).await;

        assert_eq!(chat.sent_count(), 0);
        assert_eq!(state.offset, std::fs::metadata(&path).unwrap().len());

        // The same bytes never replay once the query ends.
        flags.end_query(session);
        watcher.process_tail(&mut state).await;
        assert_eq!(chat.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_display_pass_forwards_text_turns() {
        let (dir, watcher, mut state, chat, _flags, registry) = fixture();
        let session = SessionId::new();
        registry.set_auto_sync(true).await.unwrap();
        registry.set_chat_id(1).await.unwrap();
        let path = seed_file(
            &dir,
            session,
            &[user_line("hi"), assistant_line("hello"), tool_use_line("tu_1")],
        );

        state.session = Some(session);
        state.path = Some(path);
        watcher.process_tail(&mut state).await;

        let bodies: Vec<String> = chat.sent_messages().iter().map(|m| m.text.clone()).collect();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].starts_with("[sync] You: hi"));
        assert!(bodies[1].starts_with("[sync] Bot: hello"));
    }

    #[tokio::test]
    async fn test_permission_pass_schedules_and_resolves() {
        let (dir, watcher, mut state, chat, _flags, registry) = fixture();
        let session = SessionId::new();
        registry.set_chat_id(1).await.unwrap();
        let path = seed_file(&dir, session, &[tool_use_line("tu_1")]);

        state.session = Some(session);
        state.path = Some(path.clone());
        watcher.process_tail(&mut state).await;
        assert_eq!(state.pending.len(), 1);

        // Fire the debounced notification directly.
        watcher.fire_pending_notification(&mut state).await;
        let notification = chat.find_dialog("takeover:").unwrap();
        assert!(notification.text.contains("Permission pending"));

        // A tool_result resolves it.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"tu_1"}}]}}}}"#
        )
        .unwrap();
        watcher.process_tail(&mut state).await;

        assert!(state.pending.is_empty());
        let edited = chat.current_text(notification.message_id).unwrap();
        assert!(edited.contains("✓ Resolved"));
    }

    #[tokio::test]
    async fn test_dismiss_suppresses_notification() {
        let (dir, watcher, mut state, chat, _flags, registry) = fixture();
        let session = SessionId::new();
        registry.set_chat_id(1).await.unwrap();
        let path = seed_file(&dir, session, &[tool_use_line("tu_1")]);

        state.session = Some(session);
        state.path = Some(path);
        watcher.process_tail(&mut state).await;
        watcher.fire_pending_notification(&mut state).await;
        assert!(state.notification.is_some());

        watcher
            .handle_command(&mut state, WatcherCommand::Dismiss(session))
            .await;
        assert!(state.dismissed);
        assert!(state.notification.is_none());
        assert_eq!(chat.deleted_messages().len(), 1);

        // No re-post while dismissed.
        watcher.fire_pending_notification(&mut state).await;
        assert!(state.notification.is_none());
    }
}
