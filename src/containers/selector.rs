// src/containers/selector.rs
// Chooses a container for a solve: honors a pinned chat_url, filters busy
// and chat-locked containers, and round-robins over what remains.

use crate::storage::Store;
use crate::upstream::{StatusPayload, UpstreamPool};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
#[error("not enough containers: requested={requested} available={available}")]
pub struct NotEnoughContainersError {
    pub requested: usize,
    pub available: usize,
    pub details: Value,
}

impl NotEnoughContainersError {
    fn new(requested: usize, available: usize, details: Value) -> Self {
        Self {
            requested,
            available,
            details,
        }
    }
}

#[derive(Debug, Default)]
pub struct SelectionQuery<'a> {
    pub prompt_id: &'a str,
    pub profile_id: Option<&'a str>,
    pub socks_id: Option<&'a str>,
    pub chat_url: Option<&'a str>,
    pub allowed_containers: Option<&'a [String]>,
    pub fanout: usize,
    pub request_id: Option<&'a str>,
}

fn same_url(a: Option<&str>, b: &str) -> bool {
    match a {
        Some(a) if !a.trim().is_empty() && !b.trim().is_empty() => a.trim() == b.trim(),
        _ => false,
    }
}

pub struct ContainerSelector {
    pool: Arc<UpstreamPool>,
    store: Store,
    strict_fanout: bool,
    rr_cursor: AtomicUsize,
}

impl ContainerSelector {
    pub fn new(pool: Arc<UpstreamPool>, store: Store) -> Self {
        Self {
            pool,
            store,
            strict_fanout: true,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub async fn select_containers(
        &self,
        q: SelectionQuery<'_>,
    ) -> Result<Vec<String>, NotEnoughContainersError> {
        let want = q.fanout.max(1);

        let enabled = self.pool.list_enabled();
        let candidates: Vec<String> = match q.allowed_containers {
            Some(allowed) if !allowed.is_empty() => {
                let allowed: HashSet<&String> = allowed.iter().collect();
                enabled
                    .into_iter()
                    .filter(|c| allowed.contains(c))
                    .collect()
            }
            _ => enabled,
        };

        if candidates.is_empty() {
            return Err(NotEnoughContainersError::new(
                want,
                0,
                json!({"reason": "no_enabled_containers"}),
            ));
        }

        // Containers blocked by cooperative chat locks.
        let blocked: HashSet<String> = match self.store.list_locked_containers().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                error!(error = %e, "failed to list locked containers");
                HashSet::new()
            }
        };

        debug!(
            request_id = q.request_id,
            prompt_id = q.prompt_id,
            profile_id = q.profile_id,
            chat_url = q.chat_url,
            want,
            candidates = ?candidates,
            blocked = ?blocked,
            "container selector candidates"
        );

        // A pinned chat_url must land on the exact container that renders it.
        if let Some(chat_url) = q.chat_url.map(str::trim).filter(|s| !s.is_empty()) {
            return self
                .select_for_pinned_chat(chat_url, &candidates, &blocked, q.request_id)
                .await;
        }

        let statuses = self.fetch_statuses(&candidates, q.request_id).await;

        let available: Vec<String> = statuses
            .into_iter()
            .filter(|(cid, status)| !blocked.contains(cid) && !status.is_busy())
            .map(|(cid, _)| cid)
            .collect();

        if available.is_empty() {
            let mut blocked_sorted: Vec<&String> = blocked.iter().collect();
            blocked_sorted.sort();
            return Err(NotEnoughContainersError::new(
                want,
                0,
                json!({"reason": "all_busy_or_locked", "blocked": blocked_sorted}),
            ));
        }

        // Round-robin over the available list. The cursor moves exactly once
        // per call regardless of how many ids are returned, which is fine
        // while fanout stays 1.
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        let rotated = available[start..].iter().chain(available[..start].iter());

        let mut selected: Vec<String> = Vec::new();
        for cid in rotated {
            if !selected.contains(cid) {
                selected.push(cid.clone());
            }
            if selected.len() >= want.min(available.len()) {
                break;
            }
        }

        if self.strict_fanout && selected.len() < want {
            return Err(NotEnoughContainersError::new(
                want,
                selected.len(),
                json!({"reason": "strict_fanout_not_satisfied", "selected": selected}),
            ));
        }

        Ok(selected)
    }

    async fn select_for_pinned_chat(
        &self,
        chat_url: &str,
        candidates: &[String],
        blocked: &HashSet<String>,
        request_id: Option<&str>,
    ) -> Result<Vec<String>, NotEnoughContainersError> {
        let session = match self.store.get_chat_session_by_url(chat_url).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return Err(NotEnoughContainersError::new(
                    1,
                    0,
                    json!({"reason": "chat_url_not_registered", "chat_url": chat_url}),
                ));
            }
            Err(e) => {
                error!(error = %e, chat_url, "chat session lookup failed");
                return Err(NotEnoughContainersError::new(
                    1,
                    0,
                    json!({"reason": "chat_url_not_registered", "chat_url": chat_url}),
                ));
            }
        };

        let cid = session.container_id;
        if !candidates.contains(&cid) || blocked.contains(&cid) {
            return Err(NotEnoughContainersError::new(
                1,
                0,
                json!({
                    "reason": "chat_url_container_unavailable",
                    "chat_url": chat_url,
                    "container_id": cid,
                }),
            ));
        }

        let status = match self.pool.get(&cid) {
            Some(client) => client.status(request_id).await,
            None => {
                return Err(NotEnoughContainersError::new(
                    1,
                    0,
                    json!({
                        "reason": "chat_url_container_unavailable",
                        "chat_url": chat_url,
                        "container_id": cid,
                    }),
                ));
            }
        };

        // The container must be idle AND already on the pinned URL.
        let ok = match status {
            Ok(status) => !status.is_busy() && same_url(status.page_url(), chat_url),
            Err(_) => false,
        };
        if !ok {
            return Err(NotEnoughContainersError::new(
                1,
                0,
                json!({
                    "reason": "chat_url_container_busy_or_mismatch",
                    "chat_url": chat_url,
                    "container_id": cid,
                }),
            ));
        }

        Ok(vec![cid])
    }

    /// Status fan-out across all candidates at once. A failing status call
    /// marks that candidate busy for this pass.
    async fn fetch_statuses(
        &self,
        container_ids: &[String],
        request_id: Option<&str>,
    ) -> Vec<(String, StatusPayload)> {
        let tasks = container_ids.iter().map(|cid| {
            let client = self.pool.get(cid);
            async move {
                let status = match client {
                    Some(client) => client.status(request_id).await,
                    None => Err(crate::upstream::UpstreamError::Transport(format!(
                        "unknown container_id: {cid}"
                    ))),
                };
                match status {
                    Ok(status) => (cid.clone(), status),
                    Err(e) => (
                        cid.clone(),
                        StatusPayload::new(
                            json!({"status": "error", "message": e.to_string(), "busy": true}),
                        ),
                    ),
                }
            }
        });
        futures::future::join_all(tasks).await
    }
}
