// src/engine/candidates.rs
// Candidate enumeration for one solve: which (profile, container, chat)
// combinations to try, in order.

use crate::error::{ErrorCode, SolveFailure};
use crate::storage::Store;
use crate::upstream::normalize_socks_for_compare;
use serde_json::json;
use std::collections::HashSet;
use tracing::debug;

/// How many recent chat sessions the auto path considers.
const RECENT_SESSIONS_LIMIT: i64 = 60;

#[derive(Debug, Clone)]
pub struct ProfileCandidate {
    pub profile_id: String,
    pub socks_override: Option<String>,
    pub preferred_container_id: Option<String>,
    pub preferred_chat_id: Option<String>,
    /// Set only on the pinned path; forces chat and container re-validation
    /// downstream.
    pub pinned_chat_url: Option<String>,
}

#[derive(Debug)]
pub struct CandidateQuery<'a> {
    pub prompt_id: &'a str,
    pub profile_id: Option<&'a str>,
    pub socks_override: Option<&'a str>,
    pub chat_url: Option<&'a str>,
    pub max_chat_uses: Option<i64>,
    pub default_max_chat_uses: i64,
}

fn nonempty(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t) }
}

/// Ordered candidates. Pinned chat_url produces exactly one candidate bound
/// to the session's container and chat; an explicit profile produces one
/// unpinned candidate; otherwise recent live chats come first, then the
/// remaining profiles ordered by least use.
pub async fn build_candidates(
    store: &Store,
    q: CandidateQuery<'_>,
) -> Result<Vec<ProfileCandidate>, SolveFailure> {
    if let Some(chat_url) = q.chat_url.and_then(nonempty) {
        return pinned_candidate(store, &q, chat_url).await.map(|c| vec![c]);
    }

    if let Some(profile_id) = q.profile_id.and_then(nonempty) {
        return Ok(vec![ProfileCandidate {
            profile_id: profile_id.to_string(),
            socks_override: q.socks_override.map(str::to_string),
            preferred_container_id: None,
            preferred_chat_id: None,
            pinned_chat_url: None,
        }]);
    }

    auto_candidates(store, &q).await
}

async fn pinned_candidate(
    store: &Store,
    q: &CandidateQuery<'_>,
    chat_url: &str,
) -> Result<ProfileCandidate, SolveFailure> {
    let session = store
        .get_chat_session_by_url(chat_url)
        .await
        .map_err(|e| SolveFailure::internal(format!("chat session lookup failed: {e}")))?
        .ok_or_else(|| {
            SolveFailure::with_details(
                ErrorCode::InvalidRequest,
                format!("chat_url is not registered: {chat_url}"),
                json!({"reason": "chat_url_not_registered", "chat_url": chat_url}),
            )
        })?;

    if session.is_blocked() {
        return Err(SolveFailure::with_details(
            ErrorCode::ChatBlocked,
            format!("chat_url points at a blocked session: {chat_url}"),
            json!({
                "reason": "chat_url_blocked",
                "chat_url": chat_url,
                "chat_id": session.chat_id,
                "tag": session.tag,
                "disabled": session.disabled,
            }),
        ));
    }

    if session.prompt_id != q.prompt_id {
        return Err(SolveFailure::with_details(
            ErrorCode::InvalidRequest,
            format!(
                "chat_url belongs to prompt '{}', not '{}'",
                session.prompt_id, q.prompt_id
            ),
            json!({"reason": "chat_url_prompt_mismatch", "chat_url": chat_url}),
        ));
    }

    if let Some(profile_id) = q.profile_id.and_then(nonempty) {
        if session.profile_id != profile_id {
            return Err(SolveFailure::with_details(
                ErrorCode::InvalidRequest,
                format!(
                    "chat_url belongs to profile '{}', not '{}'",
                    session.profile_id, profile_id
                ),
                json!({"reason": "chat_url_profile_mismatch", "chat_url": chat_url}),
            ));
        }
    }

    // Absent request fields adopt the session's bindings.
    let socks_override = q
        .socks_override
        .map(str::to_string)
        .or_else(|| nonempty(&session.socks_id).map(str::to_string));

    Ok(ProfileCandidate {
        profile_id: session.profile_id.clone(),
        socks_override,
        preferred_container_id: Some(session.container_id.clone()),
        preferred_chat_id: session.chat_id.clone(),
        pinned_chat_url: Some(chat_url.to_string()),
    })
}

async fn auto_candidates(
    store: &Store,
    q: &CandidateQuery<'_>,
) -> Result<Vec<ProfileCandidate>, SolveFailure> {
    let mut out: Vec<ProfileCandidate> = Vec::new();
    let mut seen: HashSet<(String, Option<String>, String, Option<String>)> = HashSet::new();
    let mut profiles_with_sessions: HashSet<String> = HashSet::new();

    let uses_limit = q
        .max_chat_uses
        .filter(|limit| *limit > 0)
        .unwrap_or(q.default_max_chat_uses);

    let override_norm = normalize_socks_for_compare(q.socks_override);

    let sessions = store
        .list_recent_chat_sessions(q.prompt_id, RECENT_SESSIONS_LIMIT)
        .await
        .map_err(|e| SolveFailure::internal(format!("chat session listing failed: {e}")))?;

    for session in sessions {
        if session.uses_count >= uses_limit {
            continue;
        }
        let session_norm = normalize_socks_for_compare(Some(&session.socks_id));
        if override_norm.is_some() && override_norm != session_norm {
            continue;
        }

        let key = (
            session.profile_id.clone(),
            session_norm.clone(),
            session.container_id.clone(),
            session.chat_id.clone(),
        );
        if !seen.insert(key) {
            continue;
        }

        profiles_with_sessions.insert(session.profile_id.clone());
        out.push(ProfileCandidate {
            profile_id: session.profile_id.clone(),
            socks_override: q
                .socks_override
                .map(str::to_string)
                .or_else(|| nonempty(&session.socks_id).map(str::to_string)),
            preferred_container_id: Some(session.container_id.clone()),
            preferred_chat_id: session.chat_id.clone(),
            pinned_chat_url: None,
        });
    }

    // Remaining profiles, least used first. Profiles already represented by
    // a live chat candidate are not repeated.
    let profiles = store
        .list_profiles()
        .await
        .map_err(|e| SolveFailure::internal(format!("profile listing failed: {e}")))?;
    for profile in profiles {
        if profiles_with_sessions.contains(&profile.profile_id) {
            continue;
        }
        if profile.pending_replace {
            continue;
        }
        if let Some(max_uses) = profile.max_uses {
            if profile.uses_count >= max_uses {
                continue;
            }
        }
        out.push(ProfileCandidate {
            profile_id: profile.profile_id.clone(),
            socks_override: q.socks_override.map(str::to_string),
            preferred_container_id: None,
            preferred_chat_id: None,
            pinned_chat_url: None,
        });
    }

    debug!(prompt_id = q.prompt_id, candidates = out.len(), "built auto candidates");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn query(prompt_id: &str) -> CandidateQuery<'_> {
        CandidateQuery {
            prompt_id,
            profile_id: None,
            socks_override: None,
            chat_url: None,
            max_chat_uses: None,
            default_max_chat_uses: 50,
        }
    }

    #[tokio::test]
    async fn explicit_profile_yields_one_plain_candidate() {
        let store = Store::in_memory().await.unwrap();
        let mut q = query("default");
        q.profile_id = Some("p1");
        let candidates = build_candidates(&store, q).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].profile_id, "p1");
        assert!(candidates[0].preferred_container_id.is_none());
    }

    #[tokio::test]
    async fn unknown_pinned_chat_url_is_invalid_request() {
        let store = Store::in_memory().await.unwrap();
        let mut q = query("default");
        q.chat_url = Some("https://x/c/ghost");
        let err = build_candidates(&store, q).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn pinned_chat_adopts_session_bindings() {
        let store = Store::in_memory().await.unwrap();
        store
            .create_chat_session("c2", "default", "p7", "s1", Some("abc"), "https://x/c/abc")
            .await
            .unwrap();

        let mut q = query("default");
        q.chat_url = Some("https://x/c/abc");
        let candidates = build_candidates(&store, q).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.profile_id, "p7");
        assert_eq!(c.socks_override.as_deref(), Some("s1"));
        assert_eq!(c.preferred_container_id.as_deref(), Some("c2"));
        assert_eq!(c.preferred_chat_id.as_deref(), Some("abc"));
        assert_eq!(c.pinned_chat_url.as_deref(), Some("https://x/c/abc"));
    }

    #[tokio::test]
    async fn pinned_chat_with_wrong_profile_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        store
            .create_chat_session("c2", "default", "p7", "", Some("abc"), "https://x/c/abc")
            .await
            .unwrap();

        let mut q = query("default");
        q.chat_url = Some("https://x/c/abc");
        q.profile_id = Some("other");
        let err = build_candidates(&store, q).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn pinned_guest_chat_is_chat_blocked() {
        let store = Store::in_memory().await.unwrap();
        store
            .create_chat_session("c1", "default", "p1", "", Some("guest"), "https://x/c/guest")
            .await
            .unwrap();

        let mut q = query("default");
        q.chat_url = Some("https://x/c/guest");
        let err = build_candidates(&store, q).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ChatBlocked);
    }

    #[tokio::test]
    async fn auto_path_prefers_live_chats_then_least_used_profiles() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_profile("pa", "/profiles/pa", None, &[], None, false)
            .await
            .unwrap();
        store
            .upsert_profile("pb", "/profiles/pb", None, &[], None, false)
            .await
            .unwrap();
        store.increment_profile_use("pa").await.unwrap();
        store
            .create_chat_session("c1", "default", "pa", "", Some("abc"), "https://x/c/abc")
            .await
            .unwrap();

        let candidates = build_candidates(&store, query("default")).await.unwrap();
        // Session candidate for pa first, then pb as a plain profile; pa is
        // not repeated as a plain candidate.
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].profile_id, "pa");
        assert_eq!(candidates[0].preferred_chat_id.as_deref(), Some("abc"));
        assert_eq!(candidates[1].profile_id, "pb");
        assert!(candidates[1].preferred_container_id.is_none());
    }

    #[tokio::test]
    async fn auto_path_skips_exhausted_sessions_and_profiles() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_profile("pa", "/profiles/pa", None, &[], Some(1), false)
            .await
            .unwrap();
        store.increment_profile_use("pa").await.unwrap();
        store
            .upsert_profile("pb", "/profiles/pb", None, &[], None, true)
            .await
            .unwrap();

        let session = store
            .create_chat_session("c1", "default", "pa", "", Some("abc"), "https://x/c/abc")
            .await
            .unwrap();
        store.increment_chat_use(session.id, 50).await.unwrap();

        // pa's session is over the reuse bound, pa itself is over max_uses,
        // pb is pending_replace: nothing remains.
        let candidates = build_candidates(&store, query("default")).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn auto_path_filters_by_socks_compatibility() {
        let store = Store::in_memory().await.unwrap();
        store
            .create_chat_session("c1", "default", "pa", "s1", Some("abc"), "https://x/c/abc")
            .await
            .unwrap();
        store
            .create_chat_session("c1", "default", "pb", "s2", Some("def"), "https://x/c/def")
            .await
            .unwrap();

        let mut q = query("default");
        q.socks_override = Some("s2");
        let candidates = build_candidates(&store, q).await.unwrap();
        let session_candidates: Vec<_> = candidates
            .iter()
            .filter(|c| c.preferred_chat_id.is_some())
            .collect();
        assert_eq!(session_candidates.len(), 1);
        assert_eq!(session_candidates[0].profile_id, "pb");
    }
}
