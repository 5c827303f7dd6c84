// src/chats/manager.rs
// Chat session lifecycle: reuse an existing conversation for a
// (container, prompt, profile, socks) tuple, create a fresh one when needed,
// and send the start prompt on first use.

use crate::prompts::PromptSpec;
use crate::storage::{ChatSessionRow, Store};
use crate::upstream::{UpstreamClient, UpstreamError};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

static CHAT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/c/([^/?#]+)").expect("chat id regex"));

/// Server-assigned chat id from a page URL like `https://x/c/<id>?q=1`.
pub fn extract_chat_id(url: &str) -> Option<String> {
    CHAT_ID_RE
        .captures(url)
        .map(|caps| caps[1].to_string())
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat_url not registered: {0}")]
    UnregisteredChatUrl(String),
    #[error("chat_url container mismatch: expected {expected}, got {actual}")]
    ContainerMismatch { expected: String, actual: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct ChatRequest<'a> {
    pub container_id: &'a str,
    pub prompt_id: &'a str,
    pub profile_id: &'a str,
    pub socks_id: Option<&'a str>,
    pub force_new: bool,
    pub max_chat_uses: Option<i64>,
    pub chat_url: Option<&'a str>,
    pub preferred_chat_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct ChatManager {
    store: Store,
    chat_root_url: String,
}

impl ChatManager {
    pub fn new(store: Store, chat_root_url: String) -> Self {
        Self {
            store,
            chat_root_url,
        }
    }

    /// Find or create the session the executor will talk in. A pinned
    /// `chat_url` must already be registered and owned by this container —
    /// the selector guarantees that, this re-checks it.
    pub async fn get_or_create_chat(
        &self,
        req: ChatRequest<'_>,
        prompt_spec: &PromptSpec,
    ) -> Result<ChatSessionRow, ChatError> {
        if let Some(chat_url) = req.chat_url.map(str::trim).filter(|s| !s.is_empty()) {
            let session = self
                .store
                .get_chat_session_by_url(chat_url)
                .await?
                .ok_or_else(|| ChatError::UnregisteredChatUrl(chat_url.to_string()))?;
            if session.container_id != req.container_id {
                return Err(ChatError::ContainerMismatch {
                    expected: req.container_id.to_string(),
                    actual: session.container_id,
                });
            }
            return Ok(session);
        }

        let socks_id = req.socks_id.unwrap_or("");
        let existing = self
            .store
            .get_chat_session(
                req.prompt_id,
                req.container_id,
                req.profile_id,
                socks_id,
                req.preferred_chat_id,
            )
            .await?;

        let uses_limit = req
            .max_chat_uses
            .filter(|limit| *limit > 0)
            .unwrap_or(prompt_spec.default_max_chat_uses);

        let reusable = match &existing {
            Some(session) if !req.force_new && session.uses_count < uses_limit => true,
            _ => false,
        };
        if reusable {
            let session = existing.expect("reusable session present");
            debug!(
                session_id = session.id,
                uses_count = session.uses_count,
                uses_limit,
                "reusing chat session"
            );
            return Ok(session);
        }

        // Fresh conversation. The chat id is unknown until the start prompt
        // lands, so the row starts at the service root URL.
        let session = self
            .store
            .create_chat_session(
                req.container_id,
                req.prompt_id,
                req.profile_id,
                socks_id,
                None,
                &self.chat_root_url,
            )
            .await?;
        info!(
            session_id = session.id,
            container_id = req.container_id,
            profile_id = req.profile_id,
            "created chat session"
        );
        Ok(session)
    }

    /// Send the start prompt if this session has never been realized. The
    /// container answers with the page URL it landed on; the `/c/<id>` part
    /// becomes the durable chat id. The start prompt counts as a use.
    pub async fn ensure_chat_loaded(
        &self,
        upstream: &UpstreamClient,
        chat_session: ChatSessionRow,
        prompt_spec: &PromptSpec,
        profile_value: &str,
        socks_url: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<ChatSessionRow, ChatError> {
        if chat_session.chat_id.is_some() {
            return Ok(chat_session);
        }

        let start_prompt = prompt_spec.start_prompt.trim();
        if start_prompt.is_empty() {
            return Ok(chat_session);
        }

        let reply = upstream
            .analyze_text(
                start_prompt,
                Some(&chat_session.page_url),
                Some(profile_value),
                socks_url,
                request_id,
            )
            .await?;

        let page_url = reply
            .page_url()
            .unwrap_or(&chat_session.page_url)
            .to_string();
        let chat_id = extract_chat_id(&page_url);

        let updated = self
            .store
            .update_chat_session(
                chat_session.id,
                chat_id.as_deref(),
                Some(&page_url),
                Some(false),
                None,
            )
            .await?;
        self.store.increment_chat_use(updated.id, 1).await?;

        info!(
            session_id = updated.id,
            chat_id = chat_id.as_deref(),
            page_url = %page_url,
            "chat session realized"
        );

        self.store
            .get_chat_session_by_id(updated.id)
            .await?
            .ok_or_else(|| ChatError::Storage(anyhow::anyhow!("chat session vanished after update")))
    }
}
