//! Daemon lifecycle: wiring, the long-poll loop, signals, and exit codes.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::ClaudeCliBackend;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::registry::SessionRegistry;
use crate::scanner::{Scanner, TakeoverHandler};
use crate::store::{ConversationStore, SessionId};
use crate::telegram::{
    BotCommand, ChatTransport, TelegramApi, TransportError, Update, UpdateKind,
};
use crate::watcher::SessionWatcher;

const LONG_POLL_SECS: u64 = 50;
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
const MAX_CONFLICTS: u32 = 3;

/// Process exit codes: 0 normal, 1 for setup conflicts, missing config, or
/// the elevated-privilege guard.
pub const EXIT_OK: u8 = 0;
pub const EXIT_SETUP: u8 = 1;

static COMMANDS: &[(&str, &str)] = &[
    ("help", "show usage"),
    ("sessions", "recent sessions"),
    ("projects", "projects with sessions"),
    ("new", "start a fresh session"),
    ("history", "recent messages"),
    ("model", "choose the model"),
    ("resume", "switch by session id prefix"),
    ("cancel", "stop the current turn"),
    ("sync", "toggle host-activity mirroring"),
];

/// Run the daemon until a signal arrives. Returns the process exit code.
pub async fn run(config: Config) -> u8 {
    if rustix::process::geteuid().is_root() && config.yolo {
        tracing::error!("refusing to run: yolo mode under elevated privileges");
        eprintln!("remotecode: refusing to run with REMOTECODE_YOLO as root");
        return EXIT_SETUP;
    }

    let chat: Arc<dyn ChatTransport> = match TelegramApi::new(&config.bot_token) {
        Ok(api) => Arc::new(api),
        Err(err) => {
            tracing::error!(error = %err, "HTTP client setup failed");
            return EXIT_SETUP;
        }
    };

    run_with_transport(config, chat).await
}

/// Daemon body with an injectable transport (tests drive it with a mock).
pub async fn run_with_transport(config: Config, chat: Arc<dyn ChatTransport>) -> u8 {
    let pid_file = config.pid_file();
    if let Some(parent) = pid_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(&pid_file, std::process::id().to_string()) {
        tracing::warn!(error = %err, "pid file write failed");
    }

    let store = ConversationStore::default_root();
    let registry = Arc::new(SessionRegistry::new(config.registry_file()));

    // Config seeds the auto-sync toggle; /sync owns it afterwards.
    if registry.get("REMOTECODE_AUTO_SYNC").await.is_none() {
        let _ = registry.set_auto_sync(config.auto_sync).await;
    }

    // CLI discovery failures surface per-turn, not at startup: the bridge
    // is still useful for browsing sessions.
    let backend = Arc::new(
        ClaudeCliBackend::discover()
            .unwrap_or_else(|_| ClaudeCliBackend::new(std::path::PathBuf::from("claude"))),
    );

    let (watcher_handle, watcher_rx) = SessionWatcher::handle();
    let orchestrator = Orchestrator::new(
        config.clone(),
        chat.clone(),
        store.clone(),
        registry.clone(),
        backend,
        watcher_handle.clone(),
    );

    let watcher = SessionWatcher::new(
        store.clone(),
        registry.clone(),
        chat.clone(),
        orchestrator.flags(),
        orchestrator.channels(),
    );
    let watcher_task = watcher.spawn(watcher_rx);

    let takeover: Arc<dyn TakeoverHandler> = orchestrator.clone();
    let scanner = Scanner::new(
        store,
        registry.clone(),
        chat.clone(),
        orchestrator.flags(),
        takeover,
    );
    let scanner_task = scanner.clone().spawn();

    // Long-poll takes over from any webhook; commands menu is cosmetic.
    let _ = chat.delete_webhook().await;
    let commands: Vec<BotCommand> = COMMANDS
        .iter()
        .map(|(command, description)| BotCommand {
            command: (*command).to_string(),
            description: (*description).to_string(),
        })
        .collect();
    let _ = chat.set_my_commands(&commands).await;

    tracing::info!("remotecode daemon up");
    let code = poll_loop(&config, &chat, &orchestrator, &scanner, &watcher_handle, &registry).await;

    scanner_task.abort();
    watcher_task.abort();
    let _ = std::fs::remove_file(&pid_file);
    tracing::info!(code, "remotecode daemon down");
    code
}

async fn poll_loop(
    config: &Config,
    chat: &Arc<dyn ChatTransport>,
    orchestrator: &Arc<Orchestrator>,
    scanner: &Arc<Scanner>,
    watcher: &crate::watcher::WatcherHandle,
    registry: &Arc<SessionRegistry>,
) -> u8 {
    let mut offset = 0i64;
    let mut conflicts = 0u32;

    loop {
        let batch = tokio::select! {
            _ = shutdown_signal() => return EXIT_OK,
            result = chat.get_updates(offset, LONG_POLL_SECS) => result,
        };

        match batch {
            Ok(updates) => {
                conflicts = 0;
                for update in updates {
                    offset = offset.max(update.id + 1);
                    dispatch(config, chat, orchestrator, scanner, watcher, update);
                }
            }
            Err(TransportError::Conflict) => {
                conflicts += 1;
                tracing::warn!(conflicts, "another poller is consuming updates");
                if conflicts >= MAX_CONFLICTS {
                    if let Some(chat_id) = registry.chat_id().await {
                        let _ = chat
                            .send_message(crate::telegram::OutgoingMessage::text(
                                chat_id,
                                "⚠️ Another remotecode instance is polling this bot. Shutting down.",
                            ))
                            .await;
                    }
                    return EXIT_SETUP;
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(err) => {
                tracing::debug!(error = %err, "long poll failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

/// Route one update. Heavy work runs on its own task so the poll loop keeps
/// turning while turns stream.
fn dispatch(
    config: &Config,
    chat: &Arc<dyn ChatTransport>,
    orchestrator: &Arc<Orchestrator>,
    scanner: &Arc<Scanner>,
    watcher: &crate::watcher::WatcherHandle,
    update: Update,
) {
    let (user_id, username) = match &update.kind {
        UpdateKind::Message(message) => (message.from.id, message.from.username.clone()),
        UpdateKind::Callback(callback) => (callback.from.id, callback.from.username.clone()),
    };
    if !config.is_user_allowed(user_id, username.as_deref()) {
        tracing::debug!(user_id, "update from unauthorized user ignored");
        return;
    }

    // Takeover and dismiss buttons belong to the scanner and watcher, not
    // the orchestrator.
    if let UpdateKind::Callback(ref callback) = update.kind {
        if let Some((prefix, rest)) = callback.data.split_once(':') {
            if prefix == "takeover" || prefix == "dismiss" {
                let Some(session) = SessionId::parse(rest) else {
                    return;
                };
                let chat = chat.clone();
                let scanner = scanner.clone();
                let watcher = watcher.clone();
                let callback_id = callback.id.clone();
                let continuing = prefix == "takeover";
                tokio::spawn(async move {
                    let _ = chat.answer_callback(&callback_id, None).await;
                    if continuing {
                        scanner.continue_in_chat(session).await;
                    } else {
                        scanner.dismiss(session).await;
                        watcher.dismiss(session);
                    }
                });
                return;
            }
        }
    }

    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.handle_update(update).await;
    });
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            // Fall back to SIGINT only.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
