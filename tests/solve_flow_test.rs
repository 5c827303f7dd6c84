// tests/solve_flow_test.rs
// First solve realizes a chat via the start prompt; later solves reuse it
// until the per-chat use budget runs out.

mod common;

use common::{spawn_app, spawn_mock_container};
use serde_json::json;

#[tokio::test]
async fn first_solve_sends_start_prompt_and_realizes_the_chat() {
    let mock = spawn_mock_container().await;
    mock.state.push_analyze(
        200,
        json!({"ok": true, "page_url": "https://x/c/abc123", "text": ""}),
    );
    mock.state.push_analyze(
        200,
        json!({"ok": true, "page_url": "https://x/c/abc123", "text": "ok"}),
    );

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(
        tmp.path(),
        &[("camoufox-1", &mock.base_url(), true)],
        "SYSTEM PROMPT",
        50,
    )
    .await;

    let (status, body) = app
        .solve(json!({
            "input": {"text": "hello"},
            "options": {"profile_id": "p1", "force_new_chat": true, "include_debug": true},
        }))
        .await;

    assert_eq!(status, 200, "body: {body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["final"]["text"], "ok");
    assert_eq!(body["meta"]["profile_id"], "p1");
    assert_eq!(body["meta"]["container_ids_used"], json!(["camoufox-1"]));
    assert_eq!(body["meta"]["chat_ids_used"], json!(["abc123"]));
    assert!(body["meta"]["job_id"].as_str().map(|s| !s.is_empty()).unwrap_or(false));

    // include_debug surfaces per-attempt outcomes.
    assert_eq!(body["attempts"][0]["container_id"], "camoufox-1");
    assert_eq!(body["attempts"][0]["status"], "succeeded");

    // The session row is realized: chat id extracted, URL moved off the root.
    let store = app.store().await;
    let session = store
        .get_chat_session("default", "camoufox-1", "p1", "", None)
        .await
        .unwrap()
        .expect("chat session exists");
    assert_eq!(session.chat_id.as_deref(), Some("abc123"));
    assert!(session.page_url.ends_with("/c/abc123"));
    assert!(session.uses_count >= 2, "start prompt + user call each count");

    // Upstream saw the start prompt first, then the user text on /c/abc123.
    let calls = mock.state.analyze_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["text"], "SYSTEM PROMPT");
    assert_eq!(calls[1]["text"], "hello");
    assert!(calls[1]["url"].as_str().unwrap().contains("/c/abc123"));

    // The job row is terminal.
    let job_id = body["meta"]["job_id"].as_str().unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "succeeded");
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn chats_are_reused_until_the_use_budget_is_reached() {
    let mock = spawn_mock_container().await;
    mock.state.set_analyze_default(
        200,
        json!({"ok": true, "page_url": "https://x/c/keep", "text": "ok"}),
    );

    let tmp = tempfile::tempdir().unwrap();
    // Empty start prompt: each solve costs exactly one chat use.
    let app = spawn_app(tmp.path(), &[("c1", &mock.base_url(), true)], "", 2).await;

    let mut session_ids = Vec::new();
    for _ in 0..3 {
        let (status, body) = app
            .solve(json!({
                "input": {"text": "hi"},
                "options": {"profile_id": "p1"},
            }))
            .await;
        assert_eq!(status, 200, "body: {body}");

        // The most recently touched session for the tuple.
        let store = app.store().await;
        let row = store
            .get_chat_session("default", "c1", "p1", "", None)
            .await
            .unwrap()
            .expect("session row");
        session_ids.push(row.id);
    }

    // Two uses per session: the third solve rolled over to a fresh row.
    assert_eq!(session_ids[0], session_ids[1]);
    assert_ne!(session_ids[1], session_ids[2]);
}

#[tokio::test]
async fn text_plus_image_draws_the_answer_from_the_image_call() {
    let mock = spawn_mock_container().await;
    mock.state.push_analyze(
        200,
        json!({"ok": true, "page_url": "https://x/c/ti", "text": "text answer"}),
    );
    mock.state.push_analyze(
        200,
        json!({"ok": true, "page_url": "https://x/c/ti", "text": "image answer"}),
    );

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(tmp.path(), &[("c1", &mock.base_url(), true)], "", 50).await;

    let (status, body) = app
        .solve(json!({
            "input": {"text": "describe", "image_b64": "QUJD", "image_ext": "png"},
            "options": {"profile_id": "p1"},
        }))
        .await;

    assert_eq!(status, 200, "body: {body}");
    assert_eq!(body["final"]["text"], "image answer");

    let calls = mock.state.analyze_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["text"], "describe");
    assert_eq!(calls[1]["image_b64"], "QUJD");
    assert_eq!(calls[1]["ext"], "png");

    // Both sub-calls count against the chat budget.
    let store = app.store().await;
    let session = store
        .get_chat_session("default", "c1", "p1", "", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.uses_count, 2);
}
