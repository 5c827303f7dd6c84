// src/api/status.rs
// Aggregate status for operators: per-container upstream status enriched
// with the chat-session row matching the page the browser is on, plus the
// guest-blocked profile set.

use crate::state::AppState;
use serde_json::{Value, json};
use std::collections::HashSet;

fn marker(value: Option<&str>, name: &str) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case(name))
        .unwrap_or(false)
}

fn looks_like_guest_page_url(page_url: Option<&str>) -> bool {
    match page_url {
        Some(url) => {
            let u = url.to_ascii_lowercase();
            u.contains("/c/guest") || u.ends_with("/guest")
        }
        None => false,
    }
}

/// `/v1/status/all` payload.
pub async fn build_status_all(state: &AppState) -> Value {
    let blocked = state.store.list_blocked_profiles().await.unwrap_or_default();
    let blocked_ids: HashSet<&str> = blocked.iter().map(|b| b.profile_id.as_str()).collect();

    let mut containers = serde_json::Map::new();
    for cid in state.pool.list_enabled() {
        let Some(client) = state.pool.get(&cid) else {
            continue;
        };
        let mut enriched = match client.status(None).await {
            Ok(status) => match status.raw {
                Value::Object(map) => Value::Object(map),
                other => json!({"status": other.to_string()}),
            },
            Err(e) => {
                containers.insert(cid, json!({"status": "error", "error": e.to_string()}));
                continue;
            }
        };

        let page_url = enriched
            .get("page_url")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Bind the live page URL back to the session row that owns it.
        let session = match &page_url {
            Some(url) => state
                .store
                .get_chat_session_by_url(url)
                .await
                .ok()
                .flatten()
                .filter(|s| s.container_id == cid),
            None => None,
        };

        let flags = match &session {
            Some(s) => json!({
                "profile_id": s.profile_id,
                "is_profile_blocked": blocked_ids.contains(s.profile_id.as_str()),
                "is_guest_chat": s.is_guest() || looks_like_guest_page_url(page_url.as_deref()),
                "is_archive_chat": marker(s.chat_id.as_deref(), "archive") || marker(s.tag.as_deref(), "archive"),
                "disabled": s.disabled,
            }),
            None => json!({
                "profile_id": null,
                "is_profile_blocked": false,
                "is_guest_chat": looks_like_guest_page_url(page_url.as_deref()),
                "is_archive_chat": false,
                "disabled": null,
            }),
        };

        if let Some(map) = enriched.as_object_mut() {
            map.insert(
                "orchestrator_chat_session".to_string(),
                session
                    .as_ref()
                    .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null),
            );
            map.insert("orchestrator_flags".to_string(), flags);
        }
        containers.insert(cid, enriched);
    }

    let blocked_count = blocked.len();
    json!({
        "db": {"sqlite_path": state.store.sqlite_path()},
        "blocked": {
            "reason": "guest",
            "profiles": blocked,
            "count": blocked_count,
            "hint_clear_guest": "POST /v1/profiles/{profile_id}/guest/clear",
        },
        "containers": Value::Object(containers),
        "profile_locks": state.profile_lock.snapshot(),
    })
}
