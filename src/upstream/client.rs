// src/upstream/client.rs
// HTTP client for one browser-automation container.
//
// Classification contract: 423 means the container is busy, other 4xx mean
// the request was rejected, 5xx mean the container failed, and transport
// faults (timeouts, resets, DNS) are retried with capped backoff. Only
// transport faults are ever retried.

use crate::upstream::io_log::{ContainerIoLogger, IoExchange};
use crate::upstream::reply::{StatusPayload, UpstreamReply};
use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream busy (HTTP {status_code})")]
    Busy { status_code: u16, payload: Value },
    #[error("upstream rejected the request (HTTP {status_code})")]
    BadRequest { status_code: u16, payload: Value },
    #[error("upstream server error (HTTP {status_code})")]
    Server { status_code: u16, payload: Value },
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Busy { status_code, .. }
            | UpstreamError::BadRequest { status_code, .. }
            | UpstreamError::Server { status_code, .. } => Some(*status_code),
            UpstreamError::Transport(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            UpstreamError::Busy { payload, .. }
            | UpstreamError::BadRequest { payload, .. }
            | UpstreamError::Server { payload, .. } => Some(payload),
            UpstreamError::Transport(_) => None,
        }
    }
}

fn classify(status_code: u16, payload: Value) -> Result<Value, UpstreamError> {
    match status_code {
        423 => Err(UpstreamError::Busy {
            status_code,
            payload,
        }),
        400..=499 => Err(UpstreamError::BadRequest {
            status_code,
            payload,
        }),
        500.. => Err(UpstreamError::Server {
            status_code,
            payload,
        }),
        _ => Ok(payload),
    }
}

fn analyze_payload(
    text: Option<&str>,
    image_b64: Option<&str>,
    ext: Option<&str>,
    url: Option<&str>,
    profile: Option<&str>,
    socks: Option<&str>,
) -> Value {
    let mut map = Map::new();
    if let Some(text) = text {
        map.insert("text".into(), Value::String(text.to_string()));
    }
    if let Some(image_b64) = image_b64 {
        map.insert("image_b64".into(), Value::String(image_b64.to_string()));
    }
    if let Some(ext) = ext {
        map.insert("ext".into(), Value::String(ext.to_string()));
    }
    if let Some(url) = url {
        map.insert("url".into(), Value::String(url.to_string()));
    }
    if let Some(profile) = profile {
        map.insert("profile".into(), Value::String(profile.to_string()));
    }
    if let Some(socks) = socks {
        map.insert("socks".into(), Value::String(socks.to_string()));
    }
    Value::Object(map)
}

pub struct UpstreamClient {
    container_id: String,
    base_url: String,
    client: reqwest::Client,
    analyze_retries: u32,
    io_log: Arc<ContainerIoLogger>,
}

impl UpstreamClient {
    pub fn new(
        container_id: &str,
        base_url: &str,
        connect_timeout_seconds: f64,
        read_timeout_seconds: f64,
        analyze_retries: u32,
        io_log: Arc<ContainerIoLogger>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(connect_timeout_seconds))
            .timeout(Duration::from_secs_f64(read_timeout_seconds))
            .build()
            .with_context(|| format!("failed to build http client for {container_id}"))?;

        Ok(Self {
            container_id: container_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            // Retries are transport-only and deliberately small.
            analyze_retries: analyze_retries.min(2),
            io_log,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self, request_id: Option<&str>) -> Result<Value, UpstreamError> {
        self.request_json(Method::GET, "/health", None, request_id)
            .await
    }

    pub async fn status(&self, request_id: Option<&str>) -> Result<StatusPayload, UpstreamError> {
        let raw = self
            .request_json(Method::GET, "/status", None, request_id)
            .await?;
        Ok(StatusPayload::new(raw))
    }

    /// Navigate the container to a URL. Not used by the solve pipeline, kept
    /// for operators driving containers by hand.
    pub async fn open(
        &self,
        url: &str,
        profile: Option<&str>,
        socks: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let payload = analyze_payload(None, None, None, Some(url), profile, socks);
        self.request_json(Method::POST, "/open", Some(&payload), request_id)
            .await
    }

    /// Text analysis. Current containers expect POST /analyze; older ones
    /// only know /analyze_text, so 404/405 falls back to the legacy route.
    pub async fn analyze_text(
        &self,
        text: &str,
        url: Option<&str>,
        profile: Option<&str>,
        socks: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<UpstreamReply, UpstreamError> {
        let payload = analyze_payload(Some(text), None, None, url, profile, socks);
        match self
            .request_json_with_retries(Method::POST, "/analyze", Some(&payload), request_id)
            .await
        {
            Ok(raw) => Ok(UpstreamReply::new(raw)),
            Err(UpstreamError::BadRequest { status_code, .. })
                if status_code == 404 || status_code == 405 =>
            {
                let raw = self
                    .request_json_with_retries(
                        Method::POST,
                        "/analyze_text",
                        Some(&payload),
                        request_id,
                    )
                    .await?;
                Ok(UpstreamReply::new(raw))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn analyze_image_b64(
        &self,
        image_b64: &str,
        ext: &str,
        url: Option<&str>,
        profile: Option<&str>,
        socks: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<UpstreamReply, UpstreamError> {
        let payload = analyze_payload(None, Some(image_b64), Some(ext), url, profile, socks);
        let raw = self
            .request_json_with_retries(Method::POST, "/analyze", Some(&payload), request_id)
            .await?;
        Ok(UpstreamReply::new(raw))
    }

    async fn request_json_with_retries(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        request_id: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let mut last_err = None;
        for attempt in 0..=self.analyze_retries {
            match self.request_json(method.clone(), path, body, request_id).await {
                Ok(v) => return Ok(v),
                Err(UpstreamError::Transport(msg)) => {
                    last_err = Some(UpstreamError::Transport(msg));
                    if attempt >= self.analyze_retries {
                        break;
                    }
                    let backoff = (0.25 * 2f64.powi(attempt as i32)).min(2.0);
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retry loop exited without error"))
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        request_id: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(request_id) = request_id {
            request = request.header("X-Request-Id", request_id);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let error = format!("{e}");
                self.io_log.log_exchange(IoExchange {
                    container_id: &self.container_id,
                    request_id,
                    method: method.as_str(),
                    path,
                    url: &url,
                    request_json: body,
                    status_code: None,
                    response: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(&error),
                });
                return Err(UpstreamError::Transport(error));
            }
        };

        let status_code = response.status().as_u16();
        let payload = match response.text().await {
            Ok(text) => serde_json::from_str(&text)
                .unwrap_or_else(|_| serde_json::json!({"_raw": text})),
            Err(e) => {
                let error = format!("{e}");
                self.io_log.log_exchange(IoExchange {
                    container_id: &self.container_id,
                    request_id,
                    method: method.as_str(),
                    path,
                    url: &url,
                    request_json: body,
                    status_code: Some(status_code),
                    response: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(&error),
                });
                return Err(UpstreamError::Transport(error));
            }
        };

        self.io_log.log_exchange(IoExchange {
            container_id: &self.container_id,
            request_id,
            method: method.as_str(),
            path,
            url: &url,
            request_json: body,
            status_code: Some(status_code),
            response: Some(&payload),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        });

        classify(status_code, payload)
    }
}
