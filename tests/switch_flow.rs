//! Session switching: background suppression, queue drain on the incoming
//! session, and stale-channel recovery.

mod support;

use std::time::Duration;

use remotecode::store::SessionId;
use remotecode::testing::ScriptStep;
use support::{assistant_text_line, fixture, tool_use_line, user_line};

#[tokio::test]
async fn switch_away_mid_stream_suppresses_rest_of_turn() {
    let fx = fixture(false).await;

    // Session A is active; session B exists on disk.
    let session_a = SessionId::new();
    let session_b = SessionId::new();
    fx.registry.set_active_session(session_a).await.unwrap();
    fx.seed_session_file(&fx.cwd, session_a, &[user_line("earlier work")]);
    fx.seed_session_file(&fx.cwd, session_b, &[user_line("other work")]);

    fx.backend.script_turn(vec![
        ScriptStep::Text("started".into()),
        ScriptStep::Delay(Duration::from_millis(300)),
        ScriptStep::ToolUse {
            id: "tu_bg".into(),
            name: "Bash".into(),
            input: serde_json::json!({"command": "sleep 10"}),
        },
        ScriptStep::Text("late text from A".into()),
        ScriptStep::Finish,
    ]);

    let turn = {
        let orchestrator = fx.orchestrator.clone();
        let update = fx.text_update("long task");
        tokio::spawn(async move { orchestrator.handle_update(update).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Tap the B button mid-stream.
    fx.orchestrator
        .handle_update(fx.callback_update(1, &format!("sess:{session_b}")))
        .await;
    fx.wait_for_text("Switched to session").await;
    turn.await.unwrap();

    // Nothing from A's remaining events reached the chat.
    assert!(fx
        .chat
        .sent_messages()
        .iter()
        .all(|m| !m.text.contains("late text from A")));

    // A's background tool use was auto-allowed (switch marks it yolo).
    assert_eq!(fx.backend.gate_log(), vec![("Bash".to_string(), true)]);

    // B is now the active selection.
    assert_eq!(fx.registry.active_session().await, Some(session_b));

    // A's channel closes once idle and out-of-date.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert!(fx.orchestrator.channels().get(session_a).is_none());
}

#[tokio::test]
async fn switching_back_resumes_cleanly() {
    let fx = fixture(true).await;
    let session_a = SessionId::new();
    let session_b = SessionId::new();
    fx.registry.set_active_session(session_a).await.unwrap();
    fx.seed_session_file(&fx.cwd, session_a, &[user_line("a history")]);
    fx.seed_session_file(&fx.cwd, session_b, &[user_line("b history")]);

    fx.backend.script_text("answer in A");
    fx.orchestrator
        .handle_update(fx.text_update("first in A"))
        .await;

    fx.orchestrator
        .handle_update(fx.callback_update(1, &format!("sess:{session_b}")))
        .await;
    fx.orchestrator
        .handle_update(fx.callback_update(1, &format!("sess:{session_a}")))
        .await;

    // Back on A, prompts stream again (suppression cleared).
    fx.backend.script_text("back again");
    fx.orchestrator
        .handle_update(fx.text_update("second in A"))
        .await;
    fx.wait_for_text("back again").await;
}

#[tokio::test]
async fn stale_channel_recreated_with_resume() {
    let fx = fixture(true).await;
    let session = SessionId::new();
    fx.registry.set_active_session(session).await.unwrap();
    let path = fx.seed_session_file(&fx.cwd, session, &[user_line("seed")]);

    fx.backend.script_text("turn one");
    fx.orchestrator.handle_update(fx.text_update("one")).await;
    assert_eq!(fx.backend.spawn_count(), 1);

    // A third party appends to the record file while the channel idles.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", assistant_text_line("host-side answer")).unwrap();
        writeln!(file, "{}", tool_use_line("tu_x", "make test")).unwrap();
    }

    fx.backend.script_text("turn two");
    fx.orchestrator.handle_update(fx.text_update("two")).await;

    // The channel was recreated via resume.
    assert_eq!(fx.backend.spawn_count(), 2);
    assert_eq!(fx.backend.resume_flags(), vec![true, true]);
    fx.wait_for_text("turn two").await;
}

#[tokio::test]
async fn unchanged_file_reuses_channel() {
    let fx = fixture(true).await;
    let session = SessionId::new();
    fx.registry.set_active_session(session).await.unwrap();
    fx.seed_session_file(&fx.cwd, session, &[user_line("seed")]);

    fx.backend.script_text("turn one");
    fx.backend.script_text("turn two");
    fx.orchestrator.handle_update(fx.text_update("one")).await;
    fx.orchestrator.handle_update(fx.text_update("two")).await;

    assert_eq!(fx.backend.spawn_count(), 1);
}
