// src/storage/models.rs
// Row types for the durable store.

use serde::Serialize;
use sqlx::FromRow;

/// Chat-id / tag sentinel: the remote assigned an anonymous chat. Any
/// profile owning such a session is blocked until the rows are deleted.
pub const GUEST_MARKER: &str = "guest";
/// Chat-id / tag sentinel: the session is retired and kept for audit only.
pub const ARCHIVE_MARKER: &str = "archive";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SocksRow {
    pub socks_id: String,
    pub url: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProfileRow {
    pub profile_id: String,
    pub profile_value: String,
    pub socks_id: Option<String>,
    pub allowed_containers_json: String,
    pub max_uses: Option<i64>,
    pub uses_count: i64,
    pub pending_replace: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileRow {
    pub fn allowed_containers(&self) -> Vec<String> {
        serde_json::from_str(&self.allowed_containers_json).unwrap_or_default()
    }
}

/// One logical browser conversation on the remote service. Created with a
/// null `chat_id` and the service root URL; realized once the start prompt
/// returns a `/c/<id>` URL.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChatSessionRow {
    pub id: i64,
    pub container_id: String,
    pub prompt_id: String,
    pub profile_id: String,
    pub socks_id: String,
    pub chat_id: Option<String>,
    pub page_url: String,
    pub uses_count: i64,
    pub disabled: bool,
    pub tag: Option<String>,
    pub locked_by: Option<String>,
    pub locked_until: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn marker_matches(value: Option<&str>, marker: &str) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case(marker))
        .unwrap_or(false)
}

impl ChatSessionRow {
    pub fn is_guest(&self) -> bool {
        marker_matches(self.chat_id.as_deref(), GUEST_MARKER)
            || marker_matches(self.tag.as_deref(), GUEST_MARKER)
    }

    pub fn is_archive(&self) -> bool {
        marker_matches(self.chat_id.as_deref(), ARCHIVE_MARKER)
            || marker_matches(self.tag.as_deref(), ARCHIVE_MARKER)
    }

    /// Unusable for reuse: guest, archive, or disabled.
    pub fn is_blocked(&self) -> bool {
        self.disabled || self.is_guest() || self.is_archive()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub job_id: String,
    pub request_id: Option<String>,
    pub prompt_id: Option<String>,
    pub selected_prompt_id: Option<String>,
    pub decision_mode: String,
    pub fanout_requested: i64,
    pub fanout_used: i64,
    pub container_ids_json: String,
    pub input_fingerprint: Option<String>,
    pub profile_id: Option<String>,
    pub socks_id: Option<String>,
    pub status: String,
    pub result_text: Option<String>,
    pub result_raw: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobAttemptRow {
    pub id: i64,
    pub job_id: String,
    pub container_id: String,
    pub prompt_id: Option<String>,
    pub profile_id: Option<String>,
    pub socks_id: Option<String>,
    pub chat_session_id: Option<i64>,
    pub chat_id: Option<String>,
    pub page_url: Option<String>,
    pub status: String,
    pub result_text: Option<String>,
    pub result_raw: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// A profile blocked by guest chat sessions, with the offending count.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlockedProfile {
    pub profile_id: String,
    pub guest_chats: i64,
}
