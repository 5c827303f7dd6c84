// tests/selector_test.rs
// Container selection behavior observable through solve responses:
// round-robin over idle containers, busy filtering, pinned chat routing.

mod common;

use common::{spawn_app, spawn_app_with_config, spawn_mock_container};
use serde_json::json;

#[tokio::test]
async fn round_robin_alternates_across_idle_containers() {
    let mock_a = spawn_mock_container().await;
    let mock_b = spawn_mock_container().await;

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(
        tmp.path(),
        &[("c1", &mock_a.base_url(), true), ("c2", &mock_b.base_url(), true)],
        "",
        50,
    )
    .await;

    let request = json!({
        "input": {"text": "hi"},
        "options": {"profile_id": "p1"},
    });

    let (status, body) = app.solve(request.clone()).await;
    assert_eq!(status, 200, "body: {body}");
    let first = body["meta"]["container_ids_used"][0].as_str().unwrap().to_string();

    let (status, body) = app.solve(request).await;
    assert_eq!(status, 200, "body: {body}");
    let second = body["meta"]["container_ids_used"][0].as_str().unwrap().to_string();

    assert_ne!(first, second, "cursor must rotate across calls");
}

#[tokio::test]
async fn busy_containers_are_filtered_out() {
    let mock_a = spawn_mock_container().await;
    let mock_b = spawn_mock_container().await;
    mock_a.state.set_status(json!({"status": "busy", "busy": true}));

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(
        tmp.path(),
        &[("c1", &mock_a.base_url(), true), ("c2", &mock_b.base_url(), true)],
        "",
        50,
    )
    .await;

    // Several solves in a row must all land on the idle container.
    for _ in 0..3 {
        let (status, body) = app
            .solve(json!({
                "input": {"text": "hi"},
                "options": {"profile_id": "p1"},
            }))
            .await;
        assert_eq!(status, 200, "body: {body}");
        assert_eq!(body["meta"]["container_ids_used"], json!(["c2"]));
    }
    assert!(mock_a.state.analyze_calls().is_empty());
}

#[tokio::test]
async fn pinned_chat_runs_on_the_owning_container() {
    let mock = spawn_mock_container().await;
    mock.state.set_analyze_default(
        200,
        json!({"ok": true, "page_url": "https://x/c/pinned", "text": "pinned ok"}),
    );

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(tmp.path(), &[("c1", &mock.base_url(), true)], "", 50).await;

    let store = app.store().await;
    store
        .create_chat_session("c1", "default", "p1", "", Some("pinned"), "https://x/c/pinned")
        .await
        .unwrap();

    let (status, body) = app
        .solve(json!({
            "input": {"text": "hi"},
            "options": {"chat_url": "https://x/c/pinned"},
        }))
        .await;

    assert_eq!(status, 200, "body: {body}");
    assert_eq!(body["meta"]["container_ids_used"], json!(["c1"]));
    assert_eq!(body["meta"]["profile_id"], "p1");
    assert_eq!(body["meta"]["chat_ids_used"], json!(["pinned"]));

    // The user text went straight into the pinned conversation.
    let calls = mock.state.analyze_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0]["url"].as_str().unwrap().contains("/c/pinned"));
}

#[tokio::test]
async fn pinned_chat_on_a_disabled_container_is_container_busy() {
    let mock_a = spawn_mock_container().await;
    let mock_b = spawn_mock_container().await;

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(
        tmp.path(),
        &[("c1", &mock_a.base_url(), true), ("c2", &mock_b.base_url(), false)],
        "",
        50,
    )
    .await;

    let store = app.store().await;
    store
        .create_chat_session("c2", "default", "p1", "", Some("cold"), "https://x/c/cold")
        .await
        .unwrap();

    let (status, body) = app
        .solve(json!({
            "input": {"text": "hi"},
            "options": {"chat_url": "https://x/c/cold"},
        }))
        .await;

    assert_eq!(status, 503, "body: {body}");
    assert_eq!(body["error"]["code"], "CONTAINER_BUSY");
}

#[tokio::test]
async fn allowed_containers_restrict_selection() {
    let mock_a = spawn_mock_container().await;
    let mock_b = spawn_mock_container().await;

    let yaml = format!(
        r#"containers:
  - id: c1
    base_url: {a}
    enabled: true
  - id: c2
    base_url: {b}
    enabled: true
profiles:
  - profile_id: p1
    profile_value: /profiles/p1
    allowed_containers:
      - c2
prompts:
  - prompt_id: default
    file: prompts/default.txt
    default_max_chat_uses: 50
chat_root_url: https://x/
"#,
        a = mock_a.base_url(),
        b = mock_b.base_url(),
    );

    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("prompts")).unwrap();
    std::fs::write(tmp.path().join("prompts/default.txt"), "").unwrap();
    let app = spawn_app_with_config(tmp.path(), &yaml).await;

    for _ in 0..2 {
        let (status, body) = app
            .solve(json!({
                "input": {"text": "hi"},
                "options": {"profile_id": "p1"},
            }))
            .await;
        assert_eq!(status, 200, "body: {body}");
        assert_eq!(body["meta"]["container_ids_used"], json!(["c2"]));
    }
    assert!(mock_a.state.analyze_calls().is_empty());
}
