//! Interactive permission dialogs: allow, per-session grants, deny-all,
//! and agent-asked questions.

mod support;

use std::time::Duration;

use remotecode::testing::ScriptStep;
use support::{fixture, CHAT};

fn grep_tool(id: &str) -> ScriptStep {
    ScriptStep::ToolUse {
        id: id.into(),
        name: "Grep".into(),
        input: serde_json::json!({"pattern": "TODO", "path": "."}),
    }
}

#[tokio::test]
async fn allow_click_resolves_dialog_and_annotates_tool_message() {
    let fx = fixture(false).await;
    fx.backend.script_turn(vec![
        ScriptStep::Text("I'll search for TODOs.".into()),
        grep_tool("tu_1"),
        ScriptStep::Text("Found three.".into()),
        ScriptStep::Finish,
    ]);

    let turn = {
        let orchestrator = fx.orchestrator.clone();
        let update = fx.text_update("grep TODO");
        tokio::spawn(async move { orchestrator.handle_update(update).await })
    };

    let dialog = fx.wait_for_dialog("perm:").await;
    assert!(dialog.text.contains("Grep"));
    let keyboard = dialog.keyboard.clone().unwrap();
    assert_eq!(keyboard.rows.iter().flatten().count(), 4);

    // The buffered text was flushed before the dialog appeared.
    let flushed = fx.wait_for_text("I'll search for TODOs.").await;
    assert!(flushed.message_id < dialog.message_id);

    let allow = &keyboard.rows[0][0];
    assert!(allow.callback_data.ends_with(":allow"));
    fx.orchestrator
        .handle_update(fx.callback_update(dialog.message_id, &allow.callback_data))
        .await;
    turn.await.unwrap();

    // Dialog deleted, tool message annotated, final text delivered.
    assert!(fx
        .chat
        .deleted_messages()
        .contains(&(CHAT, dialog.message_id)));
    fx.wait_for_text("✓ Allowed Grep").await;
    fx.wait_for_text("Found three.").await;
    assert_eq!(fx.backend.gate_log(), vec![("Grep".to_string(), true)]);
}

#[tokio::test]
async fn yolo_button_allows_followup_tools_without_dialog() {
    let fx = fixture(false).await;
    fx.backend.script_turn(vec![
        grep_tool("tu_1"),
        grep_tool("tu_2"),
        ScriptStep::Text("done".into()),
        ScriptStep::Finish,
    ]);

    let turn = {
        let orchestrator = fx.orchestrator.clone();
        let update = fx.text_update("grep twice");
        tokio::spawn(async move { orchestrator.handle_update(update).await })
    };

    let dialog = fx.wait_for_dialog("perm:").await;
    let keyboard = dialog.keyboard.clone().unwrap();
    let yolo = &keyboard.rows[1][1];
    assert!(yolo.callback_data.ends_with(":yolo"));
    fx.orchestrator
        .handle_update(fx.callback_update(dialog.message_id, &yolo.callback_data))
        .await;
    turn.await.unwrap();

    // Exactly one dialog was ever shown.
    let dialogs = fx
        .chat
        .sent_messages()
        .into_iter()
        .filter(|m| {
            m.keyboard.as_ref().is_some_and(|kb| {
                kb.rows
                    .iter()
                    .flatten()
                    .any(|b| b.callback_data.starts_with("perm:"))
            })
        })
        .count();
    assert_eq!(dialogs, 1);
    assert_eq!(
        fx.backend.gate_log(),
        vec![("Grep".to_string(), true), ("Grep".to_string(), true)]
    );
}

#[tokio::test]
async fn cancel_during_dialog_denies_and_reprompts_cleanup() {
    let fx = fixture(false).await;
    fx.backend.script_turn(vec![
        ScriptStep::Text("About to run it.".into()),
        grep_tool("tu_1"),
        ScriptStep::Text("should never render".into()),
        ScriptStep::Finish,
    ]);

    let turn = {
        let orchestrator = fx.orchestrator.clone();
        let update = fx.text_update("grep TODO");
        tokio::spawn(async move { orchestrator.handle_update(update).await })
    };

    let dialog = fx.wait_for_dialog("perm:").await;
    fx.orchestrator
        .handle_update(fx.text_update("/cancel"))
        .await;
    turn.await.unwrap();

    // Dialog body became "Cancelled"; a task-cancelled notice was sent.
    assert_eq!(
        fx.chat.current_text(dialog.message_id).as_deref(),
        Some("Cancelled")
    );
    fx.wait_for_text("Task cancelled").await;

    // The tool was denied and the cancelled turn's tail stayed silent.
    assert_eq!(fx.backend.gate_log(), vec![("Grep".to_string(), false)]);
    assert!(fx
        .chat
        .sent_messages()
        .iter()
        .all(|m| !m.text.contains("should never render")));
}

#[tokio::test]
async fn deny_all_latches_for_later_callbacks() {
    let fx = fixture(false).await;
    // Drive the arbiter directly: one check blocked on a dialog, then a
    // broadcast, then a second check that must deny without UI.
    fx.backend.script_text("unused");
    fx.orchestrator
        .handle_update(fx.text_update("warm up"))
        .await;
    let session = fx.registry.active_session().await.unwrap();

    let arbiter = fx.orchestrator.arbiter();
    let first = {
        let arbiter = arbiter.clone();
        let request = remotecode::agent::ToolUseRequest {
            session_id: session,
            correlation_id: "tu_a".into(),
            tool_name: "Bash".into(),
            input: serde_json::json!({"command": "make"}),
            reason: None,
        };
        tokio::spawn(async move {
            use remotecode::agent::ToolGate;
            arbiter.check(request).await
        })
    };

    fx.wait_for_dialog("perm:").await;
    let dialog_count_before = fx.chat.sent_count();

    arbiter.deny_all(session);
    let verdict = first.await.unwrap();
    assert!(matches!(
        verdict,
        remotecode::agent::PermissionVerdict::Deny { .. }
    ));

    // Later callbacks in the same stream deny immediately, no new dialog.
    use remotecode::agent::ToolGate;
    let verdict = arbiter
        .check(remotecode::agent::ToolUseRequest {
            session_id: session,
            correlation_id: "tu_b".into(),
            tool_name: "Edit".into(),
            input: serde_json::json!({"file_path": "/x"}),
            reason: None,
        })
        .await;
    assert!(matches!(
        verdict,
        remotecode::agent::PermissionVerdict::Deny { .. }
    ));
    assert_eq!(fx.chat.sent_count(), dialog_count_before);
}

#[tokio::test]
async fn question_answered_by_text_instead_of_button() {
    let fx = fixture(false).await;
    fx.backend.script_turn(vec![
        ScriptStep::Delay(Duration::from_millis(50)),
        ScriptStep::ToolUse {
            id: "tu_q".into(),
            name: "AskUserQuestion".into(),
            input: serde_json::json!({
                "question": "Which database?",
                "options": ["Postgres", "SQLite"],
            }),
        },
        ScriptStep::Text("Using your choice.".into()),
        ScriptStep::Finish,
    ]);

    let turn = {
        let orchestrator = fx.orchestrator.clone();
        let update = fx.text_update("set up storage");
        tokio::spawn(async move { orchestrator.handle_update(update).await })
    };

    let question = fx.wait_for_dialog("ask:").await;
    assert!(question.text.contains("Which database?"));

    // A plain text while the question is open answers it.
    fx.orchestrator
        .handle_update(fx.text_update("Postgres please"))
        .await;
    turn.await.unwrap();

    let resolved = fx.chat.current_text(question.message_id).unwrap();
    assert!(resolved.contains("Postgres please"));
    fx.wait_for_text("Using your choice.").await;

    // The text became the answer, not a queued turn.
    assert_eq!(fx.backend.spawn_count(), 1);
}
