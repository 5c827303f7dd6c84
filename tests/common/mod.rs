#![allow(dead_code)]
// tests/common/mod.rs
// Shared harness: a scripted mock container (a real axum server on an
// ephemeral port) and an orchestrator instance wired against it.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use overseer::config::load_config;
use overseer::storage::Store;
use overseer::{AppState, build_router};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock container
// ============================================================================

pub struct MockState {
    /// Body served by GET /status.
    pub status_body: Mutex<Value>,
    /// Scripted (status_code, body) responses for POST /analyze, popped in
    /// order. When empty, `analyze_default` is served.
    pub analyze_queue: Mutex<VecDeque<(u16, Value)>>,
    pub analyze_default: Mutex<(u16, Value)>,
    /// Request bodies received by POST /analyze.
    pub analyze_calls: Mutex<Vec<Value>>,
    /// Request bodies received by the legacy POST /analyze_text.
    pub analyze_text_calls: Mutex<Vec<Value>>,
    pub analyze_text_default: Mutex<(u16, Value)>,
    /// Artificial latency before each /analyze response.
    pub analyze_delay: Mutex<Duration>,
    /// Request bodies received by POST /open.
    pub open_calls: Mutex<Vec<Value>>,
}

impl MockState {
    fn new() -> Self {
        Self {
            status_body: Mutex::new(json!({
                "status": "ok",
                "busy": false,
                "page_url": "https://x/",
                "browser_loaded": true,
            })),
            analyze_queue: Mutex::new(VecDeque::new()),
            analyze_default: Mutex::new((200, json!({"ok": true, "text": "ok"}))),
            analyze_calls: Mutex::new(Vec::new()),
            analyze_text_calls: Mutex::new(Vec::new()),
            analyze_text_default: Mutex::new((200, json!({"ok": true, "text": "legacy ok"}))),
            analyze_delay: Mutex::new(Duration::ZERO),
            open_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, body: Value) {
        *self.status_body.lock().unwrap() = body;
    }

    pub fn push_analyze(&self, status: u16, body: Value) {
        self.analyze_queue.lock().unwrap().push_back((status, body));
    }

    pub fn set_analyze_default(&self, status: u16, body: Value) {
        *self.analyze_default.lock().unwrap() = (status, body);
    }

    pub fn set_analyze_delay(&self, delay: Duration) {
        *self.analyze_delay.lock().unwrap() = delay;
    }

    pub fn analyze_calls(&self) -> Vec<Value> {
        self.analyze_calls.lock().unwrap().clone()
    }

    pub fn analyze_text_calls(&self) -> Vec<Value> {
        self.analyze_text_calls.lock().unwrap().clone()
    }
}

pub struct MockContainer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockContainer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn mock_status(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(state.status_body.lock().unwrap().clone())
}

async fn mock_analyze(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    state.analyze_calls.lock().unwrap().push(body);
    let delay = *state.analyze_delay.lock().unwrap();
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }
    let (status, reply) = state
        .analyze_queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.analyze_default.lock().unwrap().clone());
    (
        axum::http::StatusCode::from_u16(status).unwrap(),
        Json(reply),
    )
}

async fn mock_analyze_text(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    state.analyze_text_calls.lock().unwrap().push(body);
    let (status, reply) = state.analyze_text_default.lock().unwrap().clone();
    (
        axum::http::StatusCode::from_u16(status).unwrap(),
        Json(reply),
    )
}

async fn mock_open(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let url = body.get("url").cloned().unwrap_or(Value::Null);
    state.open_calls.lock().unwrap().push(body);
    Json(json!({"ok": true, "page_url": url}))
}

async fn mock_health() -> Json<Value> {
    Json(json!({"ok": true}))
}

pub async fn spawn_mock_container() -> MockContainer {
    let state = Arc::new(MockState::new());
    let app = Router::new()
        .route("/health", get(mock_health))
        .route("/status", get(mock_status))
        .route("/analyze", post(mock_analyze))
        .route("/analyze_text", post(mock_analyze_text))
        .route("/open", post(mock_open))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockContainer { addr, state }
}

// ============================================================================
// Orchestrator harness
// ============================================================================

pub struct TestApp {
    pub base_url: String,
    pub sqlite_path: String,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn store(&self) -> Store {
        Store::connect(&self.sqlite_path).await.unwrap()
    }

    pub async fn solve(&self, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}/v1/solve", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

/// Write a config with the given containers and one `default` prompt, then
/// boot the orchestrator on an ephemeral port.
pub async fn spawn_app(
    dir: &Path,
    containers: &[(&str, &str, bool)],
    start_prompt: &str,
    default_max_chat_uses: i64,
) -> TestApp {
    let prompts_dir = dir.join("prompts");
    std::fs::create_dir_all(&prompts_dir).unwrap();
    std::fs::write(prompts_dir.join("default.txt"), start_prompt).unwrap();

    let mut yaml = String::from("containers:\n");
    for (id, base_url, enabled) in containers {
        yaml.push_str(&format!(
            "  - id: {id}\n    base_url: {base_url}\n    enabled: {enabled}\n"
        ));
    }
    yaml.push_str("profiles:\n  - profile_id: p1\n    profile_value: /profiles/p1\n");
    yaml.push_str(&format!(
        "prompts:\n  - prompt_id: default\n    file: prompts/default.txt\n    default_max_chat_uses: {default_max_chat_uses}\n"
    ));
    yaml.push_str("chat_root_url: https://x/\n");

    spawn_app_with_config(dir, &yaml).await
}

pub async fn spawn_app_with_config(dir: &Path, config_yaml: &str) -> TestApp {
    let config_path = dir.join("config.yaml");
    std::fs::write(&config_path, config_yaml).unwrap();

    let sqlite_path = dir.join("orchestrator.sqlite");
    let sqlite_path_str = sqlite_path.to_string_lossy().into_owned();

    let config = load_config(&config_path).unwrap();
    let store = Store::connect(&sqlite_path_str).await.unwrap();
    let state = AppState::new(config, store).await.unwrap();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        sqlite_path: sqlite_path_str,
        client: reqwest::Client::new(),
    }
}
