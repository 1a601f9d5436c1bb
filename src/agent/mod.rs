//! The Agent side of the bridge.
//!
//! Each live session owns one [`channel::AgentChannel`], which in turn owns
//! one running Agent. The Agent itself sits behind [`AgentBackend`] /
//! [`AgentHandle`] so the daemon drives the real `claude` CLI in
//! stream-JSON mode while tests drive a scripted mock. Tool permissions
//! cross the boundary as an injected [`ToolGate`]: the backend calls it for
//! every tool invocation and writes the verdict back to the Agent.

pub mod channel;
pub mod subprocess;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::store::SessionId;

pub use channel::{AgentChannel, TurnStream};
pub use subprocess::ClaudeCliBackend;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to spawn agent: {message}")]
    Spawn { message: String },

    #[error("agent CLI not found")]
    CliNotFound,

    #[error("agent protocol error: {message}")]
    Protocol { message: String },

    #[error("agent channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

// ============================================================================
// Events
// ============================================================================

/// A content block inside an assistant event.
#[derive(Clone, Debug)]
pub enum AssistantBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Typed events produced by one streaming turn. Exactly one [`Result`]
/// terminates a turn.
///
/// [`Result`]: AgentEvent::Result
#[derive(Clone, Debug)]
pub enum AgentEvent {
    SystemInit {
        session_id: SessionId,
    },
    Assistant {
        blocks: Vec<AssistantBlock>,
    },
    TaskStarted {
        description: String,
    },
    TaskNotification {
        status: String,
        summary: String,
    },
    Result {
        is_error: bool,
        errors: Vec<String>,
    },
}

impl AgentEvent {
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

// ============================================================================
// Permission gate
// ============================================================================

/// One tool invocation awaiting a verdict.
#[derive(Clone, Debug)]
pub struct ToolUseRequest {
    pub session_id: SessionId,
    /// Correlation id shared with the eventual tool_result record.
    pub correlation_id: String,
    pub tool_name: String,
    pub input: Value,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub enum PermissionVerdict {
    Allow {
        updated_input: Option<Value>,
    },
    Deny {
        reason: String,
        interrupt: bool,
    },
}

impl PermissionVerdict {
    pub fn allow() -> Self {
        Self::Allow {
            updated_input: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            interrupt: false,
        }
    }
}

/// Decides tool-use permissions. Implemented by the permission arbiter;
/// called by the backend once per tool invocation.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn check(&self, request: ToolUseRequest) -> PermissionVerdict;
}

// ============================================================================
// Backend traits
// ============================================================================

/// Everything needed to start (or resume) an Agent for one session.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub session_id: SessionId,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Resume from the on-disk record file instead of starting fresh.
    pub resume: bool,
}

/// Factory for Agent processes.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn spawn(
        &self,
        spec: SpawnSpec,
        gate: Arc<dyn ToolGate>,
    ) -> AgentResult<Arc<dyn AgentHandle>>;
}

/// A running Agent. Input is an open-ended queue of user messages; events
/// stream out until the input is closed or the process dies. Callers must
/// not read events concurrently — the channel's turn lock enforces that.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    async fn send_input(&self, text: String) -> AgentResult<()>;

    /// Next event, or `None` once the Agent is gone.
    async fn next_event(&self) -> Option<AgentEvent>;

    /// Ask the Agent to stop the current turn. The turn still terminates
    /// with a `Result` event.
    async fn interrupt(&self) -> AgentResult<()>;

    /// End the input queue and wait for the Agent to exit.
    async fn close(&self) -> AgentResult<()>;
}
