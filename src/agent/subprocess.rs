//! Agent backend driving the `claude` CLI.
//!
//! The CLI runs in bidirectional stream-JSON mode: user messages go in as
//! JSON lines on stdin, typed events come out as JSON lines on stdout, and
//! tool permissions arrive as `control_request` lines that must be answered
//! with a `control_response` before the Agent proceeds. A reader task parses
//! stdout into [`AgentEvent`]s; permission requests are answered out of band
//! through the injected [`ToolGate`], so a slow permission dialog never
//! blocks event parsing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use super::{
    AgentBackend, AgentError, AgentEvent, AgentHandle, AgentResult, AssistantBlock,
    PermissionVerdict, SpawnSpec, ToolGate, ToolUseRequest,
};
use crate::store::SessionId;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Backend that spawns the `claude` CLI.
#[derive(Clone, Debug)]
pub struct ClaudeCliBackend {
    cli_path: PathBuf,
}

impl ClaudeCliBackend {
    pub fn new(cli_path: PathBuf) -> Self {
        Self { cli_path }
    }

    /// Locate the CLI in `PATH` or the usual install locations.
    pub fn discover() -> AgentResult<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

        if let Some(path_var) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join("claude");
                if candidate.is_file() {
                    return Ok(Self::new(candidate));
                }
            }
        }

        for candidate in [
            home.join(".local/bin/claude"),
            home.join(".npm-global/bin/claude"),
            PathBuf::from("/usr/local/bin/claude"),
            home.join("node_modules/.bin/claude"),
        ] {
            if candidate.is_file() {
                return Ok(Self::new(candidate));
            }
        }

        Err(AgentError::CliNotFound)
    }

    fn build_command(&self, spec: &SpawnSpec) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("--print")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-prompt-tool")
            .arg("stdio");

        if spec.resume {
            cmd.arg("--resume").arg(spec.session_id.to_string());
        } else {
            cmd.arg("--session-id").arg(spec.session_id.to_string());
        }
        if let Some(ref model) = spec.model {
            cmd.arg("--model").arg(model);
        }

        cmd.current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    async fn spawn(
        &self,
        spec: SpawnSpec,
        gate: Arc<dyn ToolGate>,
    ) -> AgentResult<Arc<dyn AgentHandle>> {
        let mut cmd = self.build_command(&spec);
        let child = cmd.spawn().map_err(|e| AgentError::Spawn {
            message: format!("{}: {e}", self.cli_path.display()),
        })?;
        Ok(Arc::new(CliHandle::start(child, spec.session_id, gate)))
    }
}

// ============================================================================
// Handle
// ============================================================================

enum StdinCommand {
    Line(String),
    CloseInput,
}

struct CliHandle {
    stdin_tx: mpsc::UnboundedSender<StdinCommand>,
    events: Mutex<mpsc::Receiver<AgentEvent>>,
    child: Mutex<Option<Child>>,
}

impl CliHandle {
    fn start(mut child: Child, session_id: SessionId, gate: Arc<dyn ToolGate>) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<StdinCommand>();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        // Writer task: owns stdin, serializes user messages and control
        // responses onto it.
        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    match cmd {
                        StdinCommand::Line(line) => {
                            if stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                            if stdin.write_all(b"\n").await.is_err() {
                                break;
                            }
                            let _ = stdin.flush().await;
                        }
                        StdinCommand::CloseInput => {
                            let _ = stdin.shutdown().await;
                            break;
                        }
                    }
                }
            });
        }

        // Stderr drain: debug-log only.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "remotecode::agent", "agent stderr: {line}");
                }
            });
        }

        // Reader task: parses stdout lines into events and answers
        // permission requests through the gate.
        if let Some(stdout) = stdout {
            let stdin_tx_reader = stdin_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(value) = serde_json::from_str::<Value>(&line) else {
                        tracing::debug!("unparseable agent output line");
                        continue;
                    };

                    match value.get("type").and_then(Value::as_str) {
                        Some("control_request") => {
                            handle_control_request(
                                &value,
                                session_id,
                                gate.clone(),
                                stdin_tx_reader.clone(),
                            );
                        }
                        _ => {
                            if let Some(event) = parse_event(&value) {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                // Stdout closed: the Agent is gone. Dropping event_tx ends
                // the stream for the reader side.
            });
        }

        Self {
            stdin_tx,
            events: Mutex::new(event_rx),
            child: Mutex::new(Some(child)),
        }
    }
}

#[async_trait]
impl AgentHandle for CliHandle {
    async fn send_input(&self, text: String) -> AgentResult<()> {
        let message = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": text}],
            },
        });
        self.stdin_tx
            .send(StdinCommand::Line(message.to_string()))
            .map_err(|_| AgentError::Closed)
    }

    async fn next_event(&self) -> Option<AgentEvent> {
        self.events.lock().await.recv().await
    }

    async fn interrupt(&self) -> AgentResult<()> {
        let request = json!({
            "type": "control_request",
            "request_id": format!("int-{}", uuid::Uuid::new_v4()),
            "request": {"subtype": "interrupt"},
        });
        self.stdin_tx
            .send(StdinCommand::Line(request.to_string()))
            .map_err(|_| AgentError::Closed)
    }

    async fn close(&self) -> AgentResult<()> {
        let _ = self.stdin_tx.send(StdinCommand::CloseInput);
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?status, "agent exited");
                }
                _ => {
                    tracing::debug!("agent did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Wire parsing
// ============================================================================

fn parse_event(value: &Value) -> Option<AgentEvent> {
    match value.get("type").and_then(Value::as_str)? {
        "system" => {
            if value.get("subtype").and_then(Value::as_str) == Some("init") {
                let session_id = value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .and_then(SessionId::parse)?;
                Some(AgentEvent::SystemInit { session_id })
            } else {
                None
            }
        }
        "assistant" => {
            let content = value.get("message")?.get("content")?.as_array()?;
            let blocks: Vec<AssistantBlock> = content.iter().filter_map(parse_block).collect();
            if blocks.is_empty() {
                None
            } else {
                Some(AgentEvent::Assistant { blocks })
            }
        }
        "task_started" => Some(AgentEvent::TaskStarted {
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "task_notification" => Some(AgentEvent::TaskNotification {
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            summary: value
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "result" => {
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let errors = value
                .get("errors")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Some(AgentEvent::Result { is_error, errors })
        }
        _ => None,
    }
}

fn parse_block(value: &Value) -> Option<AssistantBlock> {
    match value.get("type").and_then(Value::as_str)? {
        "text" => Some(AssistantBlock::Text(
            value.get("text").and_then(Value::as_str)?.to_string(),
        )),
        "tool_use" => Some(AssistantBlock::ToolUse {
            id: value.get("id").and_then(Value::as_str)?.to_string(),
            name: value.get("name").and_then(Value::as_str)?.to_string(),
            input: value.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

/// Answer a `can_use_tool` control request through the gate. Runs as its own
/// task so the reader keeps parsing while a dialog is open.
fn handle_control_request(
    value: &Value,
    session_id: SessionId,
    gate: Arc<dyn ToolGate>,
    stdin_tx: mpsc::UnboundedSender<StdinCommand>,
) {
    let Some(request_id) = value.get("request_id").and_then(Value::as_str) else {
        return;
    };
    let Some(request) = value.get("request") else {
        return;
    };
    if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
        return;
    }

    let tool_request = ToolUseRequest {
        session_id,
        correlation_id: request
            .get("tool_use_id")
            .and_then(Value::as_str)
            .unwrap_or(request_id)
            .to_string(),
        tool_name: request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
        reason: request
            .get("reason")
            .and_then(Value::as_str)
            .map(String::from),
    };
    let request_id = request_id.to_string();

    tokio::spawn(async move {
        let verdict = gate.check(tool_request).await;
        let response = match verdict {
            PermissionVerdict::Allow { updated_input } => {
                let mut payload = json!({"behavior": "allow"});
                if let Some(input) = updated_input {
                    payload["updatedInput"] = input;
                }
                payload
            }
            PermissionVerdict::Deny { reason, interrupt } => {
                json!({"behavior": "deny", "message": reason, "interrupt": interrupt})
            }
        };
        let line = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": response,
            },
        });
        let _ = stdin_tx.send(StdinCommand::Line(line.to_string()));
    });
}
