//! Shared fixture for the orchestrator scenario suites.
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use remotecode::config::{AllowedUser, Config};
use remotecode::orchestrator::Orchestrator;
use remotecode::registry::SessionRegistry;
use remotecode::store::{encode_working_dir, ConversationStore, SessionId};
use remotecode::telegram::{CallbackQuery, IncomingMessage, Update, UpdateKind, UserRef};
use remotecode::testing::{MockAgentBackend, MockChat};
use remotecode::watcher::{SessionWatcher, WatcherCommand};

pub const CHAT: i64 = 100;
pub const USER: i64 = 1;

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub chat: Arc<MockChat>,
    pub backend: Arc<MockAgentBackend>,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<SessionRegistry>,
    pub store: ConversationStore,
    pub cwd: PathBuf,
    _watcher_rx: tokio::sync::mpsc::UnboundedReceiver<WatcherCommand>,
}

pub async fn fixture(yolo: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().join("project");
    std::fs::create_dir_all(&cwd).unwrap();

    let config = Config {
        state_dir: dir.path().join(".remotecode"),
        bot_token: "token".into(),
        allowed_users: vec![AllowedUser::Id(USER)],
        yolo,
        verbose: false,
        auto_sync: false,
    };

    let store = ConversationStore::new(dir.path().join(".claude"));
    let registry = Arc::new(SessionRegistry::new(config.registry_file()));
    registry.set_active_cwd(&cwd).await.unwrap();
    registry.set_chat_id(CHAT).await.unwrap();

    let chat = Arc::new(MockChat::new());
    let backend = Arc::new(MockAgentBackend::new());
    let (watcher_handle, watcher_rx) = SessionWatcher::handle();

    let orchestrator = Orchestrator::new(
        config,
        chat.clone(),
        store.clone(),
        registry.clone(),
        backend.clone(),
        watcher_handle,
    );

    Fixture {
        _dir: dir,
        chat,
        backend,
        orchestrator,
        registry,
        store,
        cwd,
        _watcher_rx: watcher_rx,
    }
}

impl Fixture {
    pub fn text_update(&self, text: &str) -> Update {
        static NEXT: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(1);
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Update {
            id,
            kind: UpdateKind::Message(IncomingMessage {
                chat_id: CHAT,
                message_id: 5000 + id,
                from: UserRef {
                    id: USER,
                    username: None,
                },
                text: Some(text.to_string()),
                photo_file_id: None,
                voice_file_id: None,
                caption: None,
            }),
        }
    }

    pub fn callback_update(&self, message_id: i64, data: &str) -> Update {
        Update {
            id: 0,
            kind: UpdateKind::Callback(CallbackQuery {
                id: "cb".into(),
                chat_id: CHAT,
                message_id,
                from: UserRef {
                    id: USER,
                    username: None,
                },
                data: data.to_string(),
            }),
        }
    }

    /// Wait until a sent message carries a callback with this prefix.
    pub async fn wait_for_dialog(&self, prefix: &str) -> remotecode::testing::SentMessage {
        for _ in 0..500 {
            if let Some(found) = self.chat.find_dialog(prefix) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no dialog with prefix {prefix} appeared");
    }

    /// Wait until a sent message body contains the needle.
    pub async fn wait_for_text(&self, needle: &str) -> remotecode::testing::SentMessage {
        for _ in 0..500 {
            if let Some(found) = self
                .chat
                .sent_messages()
                .into_iter()
                .find(|message| message.text.contains(needle))
            {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no message containing {needle:?} appeared");
    }

    /// Seed an on-disk session file under this fixture's working directory.
    pub fn seed_session_file(&self, cwd: &Path, session: SessionId, lines: &[String]) -> PathBuf {
        let project = self
            .store
            .projects_dir()
            .join(encode_working_dir(cwd));
        std::fs::create_dir_all(&project).unwrap();
        let path = project.join(format!("{session}.jsonl"));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }
}

pub fn user_line(text: &str) -> String {
    format!(r#"{{"type":"user","message":{{"role":"user","content":"{text}"}}}}"#)
}

pub fn assistant_text_line(text: &str) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"text","text":"{text}"}}]}}}}"#
    )
}

pub fn tool_use_line(id: &str, command: &str) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"{id}","name":"Bash","input":{{"command":"{command}"}}}}]}}}}"#
    )
}
