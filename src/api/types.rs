// src/api/types.rs
// Request/response bodies for the public HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_prompt_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolveInput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_b64: Option<String>,
    #[serde(default)]
    pub image_ext: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolveOptions {
    #[serde(default = "default_prompt_id")]
    pub prompt_id: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub socks_override: Option<String>,
    /// Legacy alias for socks_override.
    #[serde(default)]
    pub socks_id: Option<String>,
    #[serde(default)]
    pub force_new_chat: bool,
    #[serde(default)]
    pub max_chat_uses: Option<i64>,
    #[serde(default)]
    pub include_debug: bool,
    #[serde(default)]
    pub chat_url: Option<String>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            prompt_id: default_prompt_id(),
            profile_id: None,
            socks_override: None,
            socks_id: None,
            force_new_chat: false,
            max_chat_uses: None,
            include_debug: false,
            chat_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolveRequest {
    /// Legacy top-level prompt id; options.prompt_id wins when both are set.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub input: SolveInput,
    #[serde(default)]
    pub options: SolveOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveFinal {
    pub kind: &'static str,
    pub text: String,
}

impl SolveFinal {
    pub fn text(text: String) -> Self {
        Self { kind: "text", text }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveAttempt {
    pub container_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Present on every solve response, success or failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolveMeta {
    pub job_id: String,
    pub request_id: String,
    pub prompt_id_selected: String,
    pub fanout_requested: i64,
    pub container_ids_used: Vec<String>,
    pub profile_id: Option<String>,
    pub socks_id: Option<String>,
    /// Redacted: credentials are masked before this leaves the process.
    pub socks_url: Option<String>,
    pub chat_ids_used: Vec<String>,
    pub page_url: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolveResponse {
    pub ok: bool,
    #[serde(rename = "final")]
    pub final_result: Option<SolveFinal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SolveError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<SolveAttempt>>,
    pub meta: SolveMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub status: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatLockRequest {
    pub chat_url: String,
    pub locked_by: String,
    #[serde(default = "default_lock_ttl")]
    pub ttl_seconds: i64,
}

fn default_lock_ttl() -> i64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatUnlockRequest {
    pub chat_url: String,
    pub locked_by: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportQuery {
    #[serde(rename = "from")]
    pub from: String,
    pub to: String,
    #[serde(default = "default_report_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_report_limit() -> i64 {
    50
}
