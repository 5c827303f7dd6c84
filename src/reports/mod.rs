// src/reports/mod.rs
// Usage aggregations over jobs and attempts for operator dashboards.

use crate::storage::Store;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ContainerUsageRow {
    pub container_id: String,
    pub jobs_total: i64,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProfileUsageRow {
    pub profile_id: Option<String>,
    pub prompt_id: Option<String>,
    pub jobs_total: i64,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PromptUsageRow {
    pub prompt_id: Option<String>,
    pub jobs_total: i64,
    pub jobs_succeeded: i64,
    pub jobs_failed: i64,
}

fn range_meta(date_from: &str, date_to: &str, limit: i64, offset: i64) -> Value {
    json!({"from": date_from, "to": date_to, "limit": limit, "offset": offset})
}

pub async fn containers_usage(
    store: &Store,
    date_from: &str,
    date_to: &str,
    limit: i64,
    offset: i64,
) -> Result<Value> {
    let rows = sqlx::query_as::<_, ContainerUsageRow>(
        r#"
        SELECT
            container_id,
            COUNT(*) AS jobs_total,
            SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END) AS jobs_succeeded,
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS jobs_failed
        FROM job_attempts
        WHERE started_at >= ? AND started_at < ?
        GROUP BY container_id
        ORDER BY jobs_total DESC, container_id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(date_from)
    .bind(date_to)
    .bind(limit)
    .bind(offset)
    .fetch_all(store.pool())
    .await
    .context("containers usage query failed")?;

    Ok(json!({
        "ok": true,
        "items": rows,
        "meta": range_meta(date_from, date_to, limit, offset),
    }))
}

pub async fn profiles_usage(
    store: &Store,
    date_from: &str,
    date_to: &str,
    limit: i64,
    offset: i64,
) -> Result<Value> {
    let rows = sqlx::query_as::<_, ProfileUsageRow>(
        r#"
        SELECT
            profile_id,
            prompt_id,
            COUNT(*) AS jobs_total,
            SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END) AS jobs_succeeded,
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS jobs_failed
        FROM job_attempts
        WHERE started_at >= ? AND started_at < ?
        GROUP BY profile_id, prompt_id
        ORDER BY jobs_total DESC, profile_id ASC, prompt_id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(date_from)
    .bind(date_to)
    .bind(limit)
    .bind(offset)
    .fetch_all(store.pool())
    .await
    .context("profiles usage query failed")?;

    Ok(json!({
        "ok": true,
        "items": rows,
        "meta": range_meta(date_from, date_to, limit, offset),
    }))
}

pub async fn prompts_usage(
    store: &Store,
    date_from: &str,
    date_to: &str,
    limit: i64,
    offset: i64,
) -> Result<Value> {
    let rows = sqlx::query_as::<_, PromptUsageRow>(
        r#"
        SELECT
            COALESCE(selected_prompt_id, prompt_id) AS prompt_id,
            COUNT(*) AS jobs_total,
            SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END) AS jobs_succeeded,
            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS jobs_failed
        FROM jobs
        WHERE started_at >= ? AND started_at < ?
        GROUP BY COALESCE(selected_prompt_id, prompt_id)
        ORDER BY jobs_total DESC, prompt_id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(date_from)
    .bind(date_to)
    .bind(limit)
    .bind(offset)
    .fetch_all(store.pool())
    .await
    .context("prompts usage query failed")?;

    Ok(json!({
        "ok": true,
        "items": {"summary": rows},
        "meta": range_meta(date_from, date_to, limit, offset),
    }))
}
