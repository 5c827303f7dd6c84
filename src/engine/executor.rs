// src/engine/executor.rs
// The solve pipeline: validate, audit, enumerate candidates, lock the
// profile, pick a container, land in a chat, call upstream, record the
// outcome.
//
// Failure policy: a typed upstream failure in the active attempt terminates
// the whole job. Only "soft" conditions (busy profile, busy container,
// unknown profile, guest sessions in auto mode) cascade to the next
// candidate.

use crate::api::types::{
    SolveAttempt, SolveFinal, SolveMeta, SolveRequest, SolveResponse,
    SolveError as SolveErrorBody,
};
use crate::chats::{ChatError, ChatManager, manager::ChatRequest};
use crate::containers::{ContainerSelector, SelectionQuery};
use crate::engine::candidates::{CandidateQuery, ProfileCandidate, build_candidates};
use crate::error::{ErrorCode, SolveFailure, redact_proxy_url};
use crate::profiles::{ProfileLock, ProfileManager, ResolveError, ResolvedProfile};
use crate::prompts::{PromptRegistry, PromptSpec};
use crate::storage::{Store, utc_now_iso};
use crate::upstream::{UpstreamError, UpstreamPool, UpstreamReply};
use axum::http::StatusCode;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn nonempty(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t) }
}

fn short_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

/// Stable fingerprint of the solve input for the audit row.
fn input_fingerprint(text: Option<&str>, image_b64: Option<&str>, image_ext: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(text) = text {
        parts.push(format!("text:{}:{}", text.chars().count(), short_sha256(text.as_bytes())));
    }
    if let Some(image) = image_b64 {
        parts.push(format!(
            "image:{}:{}:{}",
            image_ext.unwrap_or(""),
            image.len(),
            short_sha256(image.as_bytes())
        ));
    }
    parts.join(";")
}

struct SolveContext<'a> {
    job_id: &'a str,
    request_id: &'a str,
    prompt_id: &'a str,
    prompt_spec: &'a PromptSpec,
    text: Option<&'a str>,
    image_b64: Option<&'a str>,
    image_ext: Option<&'a str>,
    force_new_chat: bool,
    max_chat_uses: Option<i64>,
    explicit: bool,
}

enum Skip {
    ProfileBusy(Value),
    ContainerBusy(Value),
    Soft,
}

enum CandidateResult {
    Success {
        text: String,
        raw: Value,
        attempt: SolveAttempt,
    },
    Skip(Skip),
}

pub struct Executor {
    store: Store,
    pool: Arc<UpstreamPool>,
    selector: Arc<ContainerSelector>,
    profiles: Arc<ProfileManager>,
    prompts: Arc<PromptRegistry>,
    profile_lock: Arc<ProfileLock>,
    chats: ChatManager,
    allow_socks_override: bool,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        pool: Arc<UpstreamPool>,
        selector: Arc<ContainerSelector>,
        profiles: Arc<ProfileManager>,
        prompts: Arc<PromptRegistry>,
        profile_lock: Arc<ProfileLock>,
        chats: ChatManager,
        allow_socks_override: bool,
    ) -> Self {
        Self {
            store,
            pool,
            selector,
            profiles,
            prompts,
            profile_lock,
            chats,
            allow_socks_override,
        }
    }

    pub async fn execute(&self, req: &SolveRequest, request_id: &str) -> (StatusCode, SolveResponse) {
        let mut meta = SolveMeta {
            request_id: request_id.to_string(),
            fanout_requested: 1,
            started_at: utc_now_iso(),
            ..SolveMeta::default()
        };

        let text = req.input.text.as_deref().and_then(nonempty);
        let image_b64 = req.input.image_b64.as_deref().and_then(nonempty);
        let image_ext = req.input.image_ext.as_deref().and_then(nonempty);

        if text.is_none() && image_b64.is_none() {
            return self.respond_failure(
                &mut meta,
                SolveFailure::invalid_request("input.text or input.image_b64 is required"),
                false,
                None,
            )
            .await;
        }
        if image_b64.is_some() && image_ext.is_none() {
            return self.respond_failure(
                &mut meta,
                SolveFailure::invalid_request("input.image_ext is required with input.image_b64"),
                false,
                None,
            )
            .await;
        }

        // options.prompt_id wins; the legacy top-level field only applies
        // while options carry the default.
        let prompt_id = if req.options.prompt_id != "default" {
            req.options.prompt_id.as_str()
        } else {
            req.prompt_id.as_deref().and_then(nonempty).unwrap_or("default")
        };
        meta.prompt_id_selected = prompt_id.to_string();

        let Some(prompt_spec) = self.prompts.get(prompt_id) else {
            return self.respond_failure(
                &mut meta,
                SolveFailure::with_details(
                    ErrorCode::InvalidRequest,
                    format!("unknown prompt_id: {prompt_id}"),
                    json!({"prompt_id": prompt_id}),
                ),
                false,
                None,
            )
            .await;
        };

        let socks_override = req
            .options
            .socks_override
            .as_deref()
            .or(req.options.socks_id.as_deref())
            .and_then(nonempty);

        // The audit row exists before any resolution so later failures still
        // leave a trace.
        let job_id = Uuid::new_v4().to_string();
        if let Err(e) = self
            .store
            .insert_job_start(
                &job_id,
                Some(request_id),
                prompt_id,
                prompt_id,
                &input_fingerprint(text, image_b64, image_ext),
            )
            .await
        {
            error!(error = %e, request_id = %request_id, "failed to insert job row");
            return self.respond_failure(
                &mut meta,
                SolveFailure::internal("failed to record job"),
                false,
                None,
            )
            .await;
        }
        meta.job_id = job_id.clone();

        let explicit =
            req.options.profile_id.is_some() || req.options.chat_url.is_some();

        let candidates = match build_candidates(
            &self.store,
            CandidateQuery {
                prompt_id,
                profile_id: req.options.profile_id.as_deref(),
                socks_override,
                chat_url: req.options.chat_url.as_deref(),
                max_chat_uses: req.options.max_chat_uses,
                default_max_chat_uses: prompt_spec.default_max_chat_uses,
            },
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(failure) => {
                return self.respond_failure(&mut meta, failure, true, None).await;
            }
        };

        let ctx = SolveContext {
            job_id: &job_id,
            request_id,
            prompt_id,
            prompt_spec: &prompt_spec,
            text,
            image_b64,
            image_ext,
            force_new_chat: req.options.force_new_chat,
            max_chat_uses: req.options.max_chat_uses,
            explicit,
        };

        let mut profile_busy = 0u32;
        let mut container_busy = 0u32;
        let mut last_busy_details: Option<Value> = None;

        for candidate in &candidates {
            match self.run_candidate(candidate, &ctx, &mut meta).await {
                Ok(CandidateResult::Success { text, raw, attempt }) => {
                    let raw_str = raw.to_string();
                    if let Err(e) = self
                        .store
                        .update_job_finish(
                            &job_id,
                            "succeeded",
                            Some(&text),
                            Some(&raw_str),
                            None,
                            None,
                        )
                        .await
                    {
                        error!(error = %e, job_id = %job_id, "failed to finalize job row");
                    }
                    meta.finished_at = utc_now_iso();
                    info!(
                        job_id = %job_id,
                        request_id = %request_id,
                        profile_id = meta.profile_id.as_deref(),
                        container_ids = ?meta.container_ids_used,
                        "solve succeeded"
                    );
                    let attempts = req.options.include_debug.then(|| vec![attempt]);
                    return (
                        StatusCode::OK,
                        SolveResponse {
                            ok: true,
                            final_result: Some(SolveFinal::text(text)),
                            error: None,
                            attempts,
                            meta: meta.clone(),
                        },
                    );
                }
                Ok(CandidateResult::Skip(skip)) => match skip {
                    Skip::ProfileBusy(details) => {
                        profile_busy += 1;
                        last_busy_details = Some(details);
                    }
                    Skip::ContainerBusy(details) => {
                        container_busy += 1;
                        last_busy_details = Some(details);
                    }
                    Skip::Soft => {}
                },
                Err(failure) => {
                    return self.respond_failure(&mut meta, failure, true, None).await;
                }
            }
        }

        // Every candidate was skipped.
        let mut details = last_busy_details.unwrap_or_else(|| json!({}));
        if let Some(map) = details.as_object_mut() {
            map.insert("profile_busy".to_string(), json!(profile_busy));
            map.insert("container_busy".to_string(), json!(container_busy));
            map.insert("candidates".to_string(), json!(candidates.len()));
        }
        let failure = if profile_busy > 0 && container_busy == 0 {
            SolveFailure::with_details(
                ErrorCode::ProfileBusy,
                "all candidate profiles are locked by in-flight requests",
                details,
            )
        } else {
            SolveFailure::with_details(
                ErrorCode::ContainerBusy,
                "no free container is available",
                details,
            )
        };
        self.respond_failure(&mut meta, failure, true, None).await
    }

    async fn run_candidate(
        &self,
        candidate: &ProfileCandidate,
        ctx: &SolveContext<'_>,
        meta: &mut SolveMeta,
    ) -> Result<CandidateResult, SolveFailure> {
        // Resolve the profile. Unknown ids are soft: the next candidate may
        // still work.
        let resolved = match self
            .profiles
            .resolve_for_request(
                &candidate.profile_id,
                candidate.socks_override.as_deref(),
                self.allow_socks_override,
            )
            .await
        {
            Ok(resolved) => resolved,
            Err(e @ (ResolveError::UnknownProfile(_) | ResolveError::UnknownSocks(_))) => {
                debug!(profile_id = %candidate.profile_id, error = %e, "skipping unresolvable candidate");
                return Ok(CandidateResult::Skip(Skip::Soft));
            }
            Err(ResolveError::Storage(e)) => {
                return Err(SolveFailure::internal(format!("profile resolution failed: {e}")));
            }
        };

        // Guest contagion gate: one guest session blocks the whole profile.
        let guest_chats = self
            .store
            .count_guest_chats_for_profile(&resolved.profile_id)
            .await
            .map_err(|e| SolveFailure::internal(format!("guest check failed: {e}")))?;
        if guest_chats > 0 {
            if ctx.explicit {
                return Err(profile_blocked_failure(&resolved.profile_id, guest_chats));
            }
            debug!(profile_id = %resolved.profile_id, guest_chats, "skipping guest-blocked profile");
            return Ok(CandidateResult::Skip(Skip::Soft));
        }

        // The guard spans chat setup and the upstream call; dropping it on
        // any exit releases the profile.
        let _lock_guard = match self
            .profile_lock
            .try_lock(&resolved.profile_id, ctx.request_id)
            .await
        {
            Ok(guard) => guard,
            Err(busy) => {
                return Ok(CandidateResult::Skip(Skip::ProfileBusy(busy.details())));
            }
        };

        let container_id = match self.choose_container(candidate, ctx, &resolved).await {
            Ok(container_id) => container_id,
            Err(skip) => return Ok(CandidateResult::Skip(skip)),
        };

        let upstream = match self.pool.get(&container_id) {
            Some(upstream) => upstream,
            None => {
                return Ok(CandidateResult::Skip(Skip::ContainerBusy(
                    json!({"reason": "container_not_registered", "container_id": container_id}),
                )));
            }
        };

        // Busy precheck: the selection window is narrow but real. A busy or
        // unreachable container here costs a skip, not a failed job.
        match upstream.status(Some(ctx.request_id)).await {
            Ok(status) if !status.is_busy() => {}
            Ok(_) => {
                return Ok(CandidateResult::Skip(Skip::ContainerBusy(
                    json!({"reason": "busy_precheck", "container_id": container_id}),
                )));
            }
            Err(e) => {
                return Ok(CandidateResult::Skip(Skip::ContainerBusy(
                    json!({"reason": "status_failed", "container_id": container_id, "error": e.to_string()}),
                )));
            }
        }

        meta.profile_id = Some(resolved.profile_id.clone());
        meta.socks_id = resolved.socks_id.clone();
        meta.socks_url = resolved.socks_url.as_deref().map(redact_proxy_url);
        meta.container_ids_used = vec![container_id.clone()];

        if let Err(e) = self
            .store
            .update_job_profile(ctx.job_id, &resolved.profile_id, resolved.socks_id.as_deref())
            .await
        {
            return Err(SolveFailure::internal(format!("failed to record profile: {e}")));
        }
        if let Err(e) = self
            .store
            .set_job_selected_containers(ctx.job_id, std::slice::from_ref(&container_id))
            .await
        {
            return Err(SolveFailure::internal(format!("failed to record containers: {e}")));
        }

        let session = match self
            .chats
            .get_or_create_chat(
                ChatRequest {
                    container_id: &container_id,
                    prompt_id: ctx.prompt_id,
                    profile_id: &resolved.profile_id,
                    socks_id: resolved.socks_id.as_deref(),
                    force_new: ctx.force_new_chat,
                    max_chat_uses: ctx.max_chat_uses,
                    chat_url: candidate.pinned_chat_url.as_deref(),
                    preferred_chat_id: candidate.preferred_chat_id.as_deref(),
                },
                ctx.prompt_spec,
            )
            .await
        {
            Ok(session) => session,
            Err(ChatError::UnregisteredChatUrl(url)) => {
                return Err(SolveFailure::with_details(
                    ErrorCode::InvalidRequest,
                    format!("chat_url is not registered: {url}"),
                    json!({"chat_url": url}),
                ));
            }
            Err(e @ ChatError::ContainerMismatch { .. }) => {
                return Err(SolveFailure::internal(e.to_string()));
            }
            Err(ChatError::Upstream(e)) => return Err(upstream_failure(e)),
            Err(ChatError::Storage(e)) => {
                return Err(SolveFailure::internal(format!("chat setup failed: {e}")));
            }
        };

        let session = match self
            .chats
            .ensure_chat_loaded(
                &upstream,
                session,
                ctx.prompt_spec,
                &resolved.profile_value,
                resolved.socks_url.as_deref(),
                Some(ctx.request_id),
            )
            .await
        {
            Ok(session) => session,
            Err(ChatError::Upstream(UpstreamError::Busy { .. })) => {
                // Start-prompt 423 is container pressure, not a job failure.
                return Ok(CandidateResult::Skip(Skip::ContainerBusy(
                    json!({"reason": "busy_start_prompt", "container_id": container_id}),
                )));
            }
            Err(ChatError::Upstream(e)) => return Err(upstream_failure(e)),
            Err(e) => {
                return Err(SolveFailure::internal(format!("start prompt failed: {e}")));
            }
        };

        meta.page_url = Some(session.page_url.clone());
        if let Some(chat_id) = &session.chat_id {
            if !meta.chat_ids_used.contains(chat_id) {
                meta.chat_ids_used.push(chat_id.clone());
            }
        }

        // The remote may have dropped us into an anonymous or retired chat.
        if session.is_guest() {
            let _ = self
                .store
                .update_chat_session(session.id, None, None, Some(true), Some("guest"))
                .await;
            if ctx.explicit {
                return Err(profile_blocked_failure(&resolved.profile_id, 1));
            }
            return Ok(CandidateResult::Skip(Skip::Soft));
        }
        if session.is_archive() || session.disabled {
            let _ = self
                .store
                .update_chat_session(session.id, None, None, Some(true), Some("archive"))
                .await;
            if ctx.explicit {
                return Err(SolveFailure::with_details(
                    ErrorCode::ChatBlocked,
                    "chat session is archived or disabled",
                    json!({"chat_session_id": session.id, "page_url": session.page_url}),
                ));
            }
            return Ok(CandidateResult::Skip(Skip::Soft));
        }

        let attempt_id = self
            .store
            .create_job_attempt(
                ctx.job_id,
                &container_id,
                ctx.prompt_id,
                &resolved.profile_id,
                resolved.socks_id.as_deref(),
                Some(session.id),
                session.chat_id.as_deref(),
                Some(&session.page_url),
            )
            .await
            .map_err(|e| SolveFailure::internal(format!("failed to record attempt: {e}")))?;

        let outcome = self
            .invoke_upstream(&upstream, ctx, &resolved, &session.page_url, session.id)
            .await;

        match outcome {
            Ok(reply) => {
                let text = reply.primary_text();
                let raw_str = reply.raw.to_string();
                if let Err(e) = self
                    .store
                    .finish_job_attempt(attempt_id, "succeeded", Some(&text), Some(&raw_str), None, None)
                    .await
                {
                    error!(error = %e, attempt_id, "failed to finalize attempt row");
                }
                if let Err(e) = self.profiles.increment_use(&resolved.profile_id).await {
                    warn!(error = %e, profile_id = %resolved.profile_id, "failed to count profile use");
                }
                Ok(CandidateResult::Success {
                    text: text.clone(),
                    raw: reply.raw,
                    attempt: SolveAttempt {
                        container_id,
                        status: "succeeded".to_string(),
                        result_text: Some(text),
                        error_code: None,
                        error_message: None,
                    },
                })
            }
            Err(e) => {
                let failure = upstream_failure(e);
                let raw = failure
                    .details
                    .as_ref()
                    .map(Value::to_string);
                if let Err(err) = self
                    .store
                    .finish_job_attempt(
                        attempt_id,
                        "failed",
                        None,
                        raw.as_deref(),
                        Some(failure.code.as_str()),
                        Some(&failure.message),
                    )
                    .await
                {
                    error!(error = %err, attempt_id, "failed to finalize attempt row");
                }
                Err(failure)
            }
        }
    }

    /// Container choice for a candidate: a usable preferred container wins
    /// outright (the pinned chat must stay on the container that owns it),
    /// otherwise the selector runs.
    async fn choose_container(
        &self,
        candidate: &ProfileCandidate,
        ctx: &SolveContext<'_>,
        resolved: &ResolvedProfile,
    ) -> Result<String, Skip> {
        if let Some(preferred) = candidate.preferred_container_id.as_deref() {
            let allowed = resolved.allowed_containers.is_empty()
                || resolved.allowed_containers.iter().any(|c| c == preferred);
            if allowed && self.pool.is_enabled(preferred) {
                return Ok(preferred.to_string());
            }
        }

        match self
            .selector
            .select_containers(SelectionQuery {
                prompt_id: ctx.prompt_id,
                profile_id: Some(&resolved.profile_id),
                socks_id: resolved.socks_id.as_deref(),
                chat_url: candidate.pinned_chat_url.as_deref(),
                allowed_containers: Some(&resolved.allowed_containers),
                fanout: 1,
                request_id: Some(ctx.request_id),
            })
            .await
        {
            Ok(mut ids) if !ids.is_empty() => Ok(ids.remove(0)),
            Ok(_) => Err(Skip::ContainerBusy(json!({"reason": "empty_selection"}))),
            Err(e) => Err(Skip::ContainerBusy(e.details)),
        }
    }

    /// Text-only, image-only, or text-then-image on the same URL. The final
    /// text comes from the last reply; every sub-call counts as a chat use.
    async fn invoke_upstream(
        &self,
        upstream: &crate::upstream::UpstreamClient,
        ctx: &SolveContext<'_>,
        resolved: &ResolvedProfile,
        page_url: &str,
        session_id: i64,
    ) -> Result<UpstreamReply, UpstreamError> {
        let mut last: Option<UpstreamReply> = None;

        if let Some(text) = ctx.text {
            let reply = upstream
                .analyze_text(
                    text,
                    Some(page_url),
                    Some(&resolved.profile_value),
                    resolved.socks_url.as_deref(),
                    Some(ctx.request_id),
                )
                .await?;
            if let Err(e) = self.store.increment_chat_use(session_id, 1).await {
                warn!(error = %e, session_id, "failed to count chat use");
            }
            last = Some(reply);
        }

        if let Some(image) = ctx.image_b64 {
            let reply = upstream
                .analyze_image_b64(
                    image,
                    ctx.image_ext.unwrap_or(""),
                    Some(page_url),
                    Some(&resolved.profile_value),
                    resolved.socks_url.as_deref(),
                    Some(ctx.request_id),
                )
                .await?;
            if let Err(e) = self.store.increment_chat_use(session_id, 1).await {
                warn!(error = %e, session_id, "failed to count chat use");
            }
            last = Some(reply);
        }

        Ok(last.expect("input validated to contain text or image"))
    }

    async fn respond_failure(
        &self,
        meta: &mut SolveMeta,
        failure: SolveFailure,
        job_inserted: bool,
        attempts: Option<Vec<SolveAttempt>>,
    ) -> (StatusCode, SolveResponse) {
        if job_inserted {
            if let Err(e) = self
                .store
                .update_job_finish(
                    &meta.job_id,
                    "failed",
                    None,
                    None,
                    Some(failure.code.as_str()),
                    Some(&failure.message),
                )
                .await
            {
                error!(error = %e, job_id = %meta.job_id, "failed to finalize job row");
            }
        }
        meta.finished_at = utc_now_iso();

        info!(
            job_id = %meta.job_id,
            request_id = %meta.request_id,
            code = failure.code.as_str(),
            message = %failure.message,
            "solve failed"
        );

        (
            failure.code.http_status(),
            SolveResponse {
                ok: false,
                final_result: None,
                error: Some(SolveErrorBody {
                    code: failure.code.as_str().to_string(),
                    message: failure.message,
                    details: failure.details,
                }),
                attempts,
                meta: meta.clone(),
            },
        )
    }
}

fn profile_blocked_failure(profile_id: &str, guest_chats: i64) -> SolveFailure {
    SolveFailure::with_details(
        ErrorCode::ProfileBlocked,
        format!("profile '{profile_id}' is blocked by guest chat sessions"),
        json!({
            "profile_id": profile_id,
            "guest_chats": guest_chats,
            "hint_clear_guest": format!("POST /v1/profiles/{profile_id}/guest/clear"),
        }),
    )
}

fn upstream_failure(e: UpstreamError) -> SolveFailure {
    match e {
        UpstreamError::Busy {
            status_code,
            payload,
        } => SolveFailure::with_details(
            ErrorCode::ContainerBusy,
            "container is busy",
            json!({"status_code": status_code, "payload": payload}),
        ),
        UpstreamError::BadRequest {
            status_code,
            payload,
        } => SolveFailure::with_details(
            ErrorCode::InvalidRequest,
            "upstream rejected the content",
            json!({"status_code": status_code, "payload": payload}),
        ),
        UpstreamError::Server {
            status_code,
            payload,
        } => SolveFailure::with_details(
            ErrorCode::UpstreamError,
            "upstream server error",
            json!({"status_code": status_code, "payload": payload}),
        ),
        UpstreamError::Transport(message) => SolveFailure::with_details(
            ErrorCode::UpstreamError,
            "upstream transport error",
            json!({"error": message}),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_distinguishes_inputs() {
        let a = input_fingerprint(Some("hello"), None, None);
        let b = input_fingerprint(Some("world"), None, None);
        assert_ne!(a, b);
        assert!(a.starts_with("text:5:"));

        let c = input_fingerprint(Some("hi"), Some("QUJD"), Some("png"));
        assert!(c.contains(";image:png:4:"));
    }

    #[test]
    fn upstream_errors_map_to_error_codes() {
        let busy = upstream_failure(UpstreamError::Busy {
            status_code: 423,
            payload: json!({}),
        });
        assert_eq!(busy.code, ErrorCode::ContainerBusy);

        let bad = upstream_failure(UpstreamError::BadRequest {
            status_code: 400,
            payload: json!({}),
        });
        assert_eq!(bad.code, ErrorCode::InvalidRequest);

        let server = upstream_failure(UpstreamError::Server {
            status_code: 500,
            payload: json!({}),
        });
        assert_eq!(server.code, ErrorCode::UpstreamError);

        let transport = upstream_failure(UpstreamError::Transport("reset".into()));
        assert_eq!(transport.code, ErrorCode::UpstreamError);
    }
}
