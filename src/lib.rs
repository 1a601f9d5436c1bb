//! # remotecode
//!
//! A remote-control bridge between a chat client and a locally running AI
//! coding agent. Messages from the chat flow into long-lived per-session
//! agent processes; the agent's responses stream back as chat messages;
//! tool-use permissions are arbitrated with inline-keyboard dialogs; and the
//! in-memory view stays reconciled with the conversation files the agent
//! (or a command-line user on the same host) writes to disk.
//!
//! The crate is organized leaves-first:
//!
//! - [`store`]: read-only index of on-disk conversation files
//! - [`registry`]: persisted active-selection state
//! - [`agent`]: per-session channels over the agent subprocess
//! - [`permissions`]: the tool-permission policy cascade and dialogs
//! - [`orchestrator`]: per-update dispatch and turn execution
//! - [`watcher`]: tailing of the active session's record file
//! - [`scanner`]: pending-permission sweep across background sessions
//! - [`telegram`]: the chat-transport interface and thin Bot API client
//! - [`daemon`]: wiring, signals, and the long-poll loop

pub mod agent;
pub mod config;
pub mod daemon;
pub mod observability;
pub mod orchestrator;
pub mod permissions;
pub mod registry;
pub mod scanner;
pub mod state;
pub mod store;
pub mod telegram;
pub mod testing;
pub mod watcher;

pub use agent::{AgentBackend, AgentChannel, AgentError, AgentEvent, ClaudeCliBackend};
pub use config::{Config, ConfigError};
pub use orchestrator::Orchestrator;
pub use permissions::PermissionArbiter;
pub use registry::SessionRegistry;
pub use scanner::{Scanner, TakeoverHandler};
pub use store::{ConversationStore, SessionId};
pub use telegram::{ChatTransport, TelegramApi};
pub use watcher::{SessionWatcher, WatcherHandle};

/// Crate version, reported by the daemon at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
