// tests/busy_precheck_test.rs
// A container reporting busy on /status is never sent analyze traffic, and
// the job is still recorded as failed.

mod common;

use common::{spawn_app, spawn_mock_container};
use serde_json::json;

async fn busy_precheck_case(status_payload: serde_json::Value) {
    let mock = spawn_mock_container().await;
    mock.state.set_status(status_payload);

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
            "input": {"text": "hi"},
            "options": {"profile_id": "p1"},
        }))
        .await;

    assert_eq!(status, 503, "body: {body}");
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "CONTAINER_BUSY");

    let job_id = body["meta"]["job_id"].as_str().unwrap();
    assert!(!job_id.is_empty());

    // The job row is terminal and carries the error.
    let store = app.store().await;
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "failed");
    assert_eq!(job.error_code.as_deref(), Some("CONTAINER_BUSY"));
    assert!(job.error_message.as_deref().map(|m| !m.is_empty()).unwrap_or(false));
    assert!(job.finished_at.is_some());

    // No analyze call was issued against the busy container.
    assert!(mock.state.analyze_calls().is_empty());
    assert!(mock.state.analyze_text_calls().is_empty());
}

#[tokio::test]
async fn busy_flag_blocks_the_container() {
    busy_precheck_case(json!({"status": "ok", "busy": true, "message": "working"})).await;
}

#[tokio::test]
async fn busy_status_string_blocks_the_container() {
    busy_precheck_case(json!({"status": "busy", "busy": false, "message": "working"})).await;
}

#[tokio::test]
async fn mid_call_423_fails_the_job_as_container_busy() {
    let mock = spawn_mock_container().await;
    // Status says idle; the analyze call itself answers 423.
    mock.state.push_analyze(423, json!({"detail": "locked"}));

    let tmp = tempfile::tempdir().unwrap();
    let app = spawn_app(tmp.path(), &[("c1", &mock.base_url(), true)], "", 50).await;

    let (status, body) = app
        .solve(json!({
            "input": {"text": "hi"},
            "options": {"profile_id": "p1"},
        }))
        .await;

    assert_eq!(status, 503, "body: {body}");
    assert_eq!(body["error"]["code"], "CONTAINER_BUSY");

    // The attempt row exists and is terminal: the failure happened mid-call,
    // after selection.
    let store = app.store().await;
    let job_id = body["meta"]["job_id"].as_str().unwrap();
    let attempts = store.list_job_attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "failed");
    assert_eq!(attempts[0].error_code.as_deref(), Some("CONTAINER_BUSY"));
    assert!(attempts[0].finished_at.is_some());
}
