// src/storage/mod.rs
// Durable state: socks, profiles, chat sessions, jobs, attempts.
//
// SQLite via sqlx with WAL journaling. Every public operation is atomic on
// its own; callers decide about retries. Timestamps are ISO-8601 UTC strings
// so lexicographic comparison matches chronological order.

pub mod models;

use anyhow::{Context, Result};
use chrono::{Duration, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub use models::{
    ARCHIVE_MARKER, BlockedProfile, ChatSessionRow, GUEST_MARKER, JobAttemptRow, JobRow,
    ProfileRow, SocksRow,
};

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

const GUEST_PREDICATE: &str =
    "(LOWER(TRIM(COALESCE(chat_id, ''))) = 'guest' OR LOWER(TRIM(COALESCE(tag, ''))) = 'guest')";

const REUSABLE_PREDICATE: &str = "disabled = 0 \
     AND LOWER(TRIM(COALESCE(chat_id, ''))) NOT IN ('guest', 'archive') \
     AND LOWER(TRIM(COALESCE(tag, ''))) NOT IN ('guest', 'archive')";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    sqlite_path: String,
}

impl Store {
    /// Open (creating if missing) the SQLite database at `path` and run
    /// migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create data dir {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .with_context(|| format!("invalid sqlite path: {path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite db at {path}"))?;

        let store = Self {
            pool,
            sqlite_path: path.to_string(),
        };
        store.migrate().await?;
        info!(sqlite_path = %path, "storage ready");
        Ok(store)
    }

    /// In-memory store for tests and diagnostics. Single connection: each
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .context("failed to open in-memory sqlite db")?;
        let store = Self {
            pool,
            sqlite_path: ":memory:".to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sqlite_path(&self) -> &str {
        &self.sqlite_path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS socks (
                socks_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS profiles (
                profile_id TEXT PRIMARY KEY,
                profile_value TEXT NOT NULL,
                socks_id TEXT,
                allowed_containers_json TEXT NOT NULL DEFAULT '[]',
                max_uses INTEGER,
                uses_count INTEGER NOT NULL DEFAULT 0,
                pending_replace INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL,
                prompt_id TEXT NOT NULL,
                profile_id TEXT NOT NULL,
                socks_id TEXT NOT NULL DEFAULT '',
                chat_id TEXT,
                page_url TEXT NOT NULL,
                uses_count INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                tag TEXT,
                locked_by TEXT,
                locked_until TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_sessions_keys
            ON chat_sessions(prompt_id, container_id, profile_id, socks_id, updated_at DESC);

            CREATE INDEX IF NOT EXISTS idx_chat_sessions_page_url
            ON chat_sessions(page_url);

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                request_id TEXT,
                prompt_id TEXT,
                selected_prompt_id TEXT,
                decision_mode TEXT NOT NULL DEFAULT 'multi',
                fanout_requested INTEGER NOT NULL DEFAULT 1,
                fanout_used INTEGER NOT NULL DEFAULT 1,
                container_ids_json TEXT NOT NULL DEFAULT '[]',
                input_fingerprint TEXT,
                profile_id TEXT,
                socks_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                result_text TEXT,
                result_raw TEXT,
                error_code TEXT,
                error_message TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_started_at ON jobs(started_at);

            CREATE TABLE IF NOT EXISTS job_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                prompt_id TEXT,
                profile_id TEXT,
                socks_id TEXT,
                chat_session_id INTEGER,
                chat_id TEXT,
                page_url TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                result_text TEXT,
                result_raw TEXT,
                error_code TEXT,
                error_message TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_job_attempts_job ON job_attempts(job_id);
            CREATE INDEX IF NOT EXISTS idx_job_attempts_started_at ON job_attempts(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to initialize storage schema")?;

        // Additive columns for databases created by older builds.
        self.ensure_column("chat_sessions", "tag", "TEXT").await?;
        self.ensure_column("chat_sessions", "locked_by", "TEXT").await?;
        self.ensure_column("chat_sessions", "locked_until", "TEXT").await?;
        self.ensure_column("profiles", "max_uses", "INTEGER").await?;
        self.ensure_column("profiles", "pending_replace", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column("jobs", "selected_prompt_id", "TEXT").await?;
        self.ensure_column("jobs", "input_fingerprint", "TEXT").await?;
        self.ensure_column("job_attempts", "chat_session_id", "INTEGER")
            .await?;

        Ok(())
    }

    async fn ensure_column(&self, table: &str, column: &str, ddl: &str) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to inspect table {table}"))?;

        let exists = rows
            .iter()
            .any(|r| r.get::<String, _>("name").eq_ignore_ascii_case(column));
        if exists {
            return Ok(());
        }

        debug!(table, column, "adding missing column");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to add column {table}.{column}"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Socks
    // ------------------------------------------------------------------

    pub async fn upsert_socks(&self, socks_id: &str, url: &str) -> Result<()> {
        let now = utc_now_iso();
        sqlx::query(
            "INSERT INTO socks (socks_id, url, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(socks_id) DO UPDATE SET url = excluded.url, updated_at = excluded.updated_at",
        )
        .bind(socks_id)
        .bind(url)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to upsert socks")?;
        Ok(())
    }

    pub async fn get_socks(&self, socks_id: &str) -> Result<Option<SocksRow>> {
        let row = sqlx::query_as::<_, SocksRow>("SELECT * FROM socks WHERE socks_id = ?")
            .bind(socks_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read socks")?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub async fn upsert_profile(
        &self,
        profile_id: &str,
        profile_value: &str,
        socks_id: Option<&str>,
        allowed_containers: &[String],
        max_uses: Option<i64>,
        pending_replace: bool,
    ) -> Result<()> {
        let now = utc_now_iso();
        let allowed_json = serde_json::to_string(allowed_containers)?;
        sqlx::query(
            r#"
            INSERT INTO profiles (
                profile_id, profile_value, socks_id, allowed_containers_json,
                max_uses, uses_count, pending_replace, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(profile_id) DO UPDATE SET
                profile_value = excluded.profile_value,
                socks_id = excluded.socks_id,
                allowed_containers_json = excluded.allowed_containers_json,
                max_uses = excluded.max_uses,
                pending_replace = excluded.pending_replace,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(profile_id)
        .bind(profile_value)
        .bind(socks_id)
        .bind(&allowed_json)
        .bind(max_uses)
        .bind(pending_replace)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to upsert profile")?;
        Ok(())
    }

    pub async fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRow>> {
        let row = sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read profile")?;
        Ok(row)
    }

    /// All profiles, least used first (candidate fallback ordering).
    pub async fn list_profiles(&self) -> Result<Vec<ProfileRow>> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            "SELECT * FROM profiles ORDER BY uses_count ASC, profile_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list profiles")?;
        Ok(rows)
    }

    pub async fn increment_profile_use(&self, profile_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE profiles SET uses_count = uses_count + 1, updated_at = ? WHERE profile_id = ?",
        )
        .bind(utc_now_iso())
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .context("failed to increment profile use")?;
        Ok(())
    }

    pub async fn set_profile_pending_replace(
        &self,
        profile_id: &str,
        pending_replace: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE profiles SET pending_replace = ?, updated_at = ? WHERE profile_id = ?",
        )
        .bind(pending_replace)
        .bind(utc_now_iso())
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .context("failed to set pending_replace")?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Chat sessions
    // ------------------------------------------------------------------

    /// Most recently updated reusable session for the exact
    /// (prompt, container, profile, socks) tuple. Disabled and guest/archive
    /// rows never match. `preferred_chat_id` narrows to that chat only.
    pub async fn get_chat_session(
        &self,
        prompt_id: &str,
        container_id: &str,
        profile_id: &str,
        socks_id: &str,
        preferred_chat_id: Option<&str>,
    ) -> Result<Option<ChatSessionRow>> {
        let mut sql = format!(
            "SELECT * FROM chat_sessions \
             WHERE prompt_id = ? AND container_id = ? AND profile_id = ? AND socks_id = ? \
             AND {REUSABLE_PREDICATE}"
        );
        if preferred_chat_id.is_some() {
            sql.push_str(" AND chat_id = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT 1");

        let mut query = sqlx::query_as::<_, ChatSessionRow>(&sql)
            .bind(prompt_id)
            .bind(container_id)
            .bind(profile_id)
            .bind(socks_id);
        if let Some(chat_id) = preferred_chat_id {
            query = query.bind(chat_id);
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("failed to read chat session")?;
        Ok(row)
    }

    pub async fn create_chat_session(
        &self,
        container_id: &str,
        prompt_id: &str,
        profile_id: &str,
        socks_id: &str,
        chat_id: Option<&str>,
        page_url: &str,
    ) -> Result<ChatSessionRow> {
        let now = utc_now_iso();
        let result = sqlx::query(
            r#"
            INSERT INTO chat_sessions (
                container_id, prompt_id, profile_id, socks_id,
                chat_id, page_url, uses_count, disabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(container_id)
        .bind(prompt_id)
        .bind(profile_id)
        .bind(socks_id)
        .bind(chat_id)
        .bind(page_url)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to create chat session")?;

        self.get_chat_session_by_id(result.last_insert_rowid())
            .await?
            .context("created chat session not found")
    }

    pub async fn get_chat_session_by_id(&self, id: i64) -> Result<Option<ChatSessionRow>> {
        let row = sqlx::query_as::<_, ChatSessionRow>("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read chat session by id")?;
        Ok(row)
    }

    /// Lookup by exact page URL, ignoring disabled/guest/archive filters so
    /// admin and diagnostic paths can inspect blocked rows.
    pub async fn get_chat_session_by_url(&self, page_url: &str) -> Result<Option<ChatSessionRow>> {
        let row = sqlx::query_as::<_, ChatSessionRow>(
            "SELECT * FROM chat_sessions WHERE page_url = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(page_url)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read chat session by url")?;
        Ok(row)
    }

    /// Each parameter is applied only when non-null (COALESCE semantics).
    pub async fn update_chat_session(
        &self,
        id: i64,
        chat_id: Option<&str>,
        page_url: Option<&str>,
        disabled: Option<bool>,
        tag: Option<&str>,
    ) -> Result<ChatSessionRow> {
        sqlx::query(
            r#"
            UPDATE chat_sessions SET
                chat_id = COALESCE(?, chat_id),
                page_url = COALESCE(?, page_url),
                disabled = COALESCE(?, disabled),
                tag = COALESCE(?, tag),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(chat_id)
        .bind(page_url)
        .bind(disabled)
        .bind(tag)
        .bind(utc_now_iso())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update chat session")?;

        self.get_chat_session_by_id(id)
            .await?
            .context("updated chat session not found")
    }

    pub async fn increment_chat_use(&self, id: i64, by: i64) -> Result<()> {
        sqlx::query(
            "UPDATE chat_sessions SET uses_count = uses_count + ?, updated_at = ? WHERE id = ?",
        )
        .bind(by)
        .bind(utc_now_iso())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to increment chat use")?;
        Ok(())
    }

    /// Recent reusable sessions for a prompt (auto candidate enumeration).
    pub async fn list_recent_chat_sessions(
        &self,
        prompt_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatSessionRow>> {
        let sql = format!(
            "SELECT * FROM chat_sessions WHERE prompt_id = ? AND {REUSABLE_PREDICATE} \
             ORDER BY updated_at DESC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ChatSessionRow>(&sql)
            .bind(prompt_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to list recent chat sessions")?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Guest / archive lifecycle
    // ------------------------------------------------------------------

    pub async fn profile_has_guest_chat(&self, profile_id: &str) -> Result<bool> {
        Ok(self.count_guest_chats_for_profile(profile_id).await? > 0)
    }

    pub async fn count_guest_chats_for_profile(&self, profile_id: &str) -> Result<i64> {
        let sql =
            format!("SELECT COUNT(*) FROM chat_sessions WHERE profile_id = ? AND {GUEST_PREDICATE}");
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(profile_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to count guest chats")?;
        Ok(count)
    }

    pub async fn delete_guest_chats_for_profile(&self, profile_id: &str) -> Result<u64> {
        let sql = format!("DELETE FROM chat_sessions WHERE profile_id = ? AND {GUEST_PREDICATE}");
        let result = sqlx::query(&sql)
            .bind(profile_id)
            .execute(&self.pool)
            .await
            .context("failed to delete guest chats")?;
        Ok(result.rows_affected())
    }

    /// Retire every chat session of a profile. Rows persist for audit with
    /// `tag='archive', disabled=1`.
    pub async fn archive_chats_for_profile(&self, profile_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET tag = 'archive', disabled = 1, updated_at = ? \
             WHERE profile_id = ?",
        )
        .bind(utc_now_iso())
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .context("failed to archive chats")?;
        Ok(result.rows_affected())
    }

    pub async fn list_blocked_profiles(&self) -> Result<Vec<BlockedProfile>> {
        let sql = format!(
            "SELECT profile_id, COUNT(*) AS guest_chats FROM chat_sessions \
             WHERE {GUEST_PREDICATE} GROUP BY profile_id ORDER BY profile_id ASC"
        );
        let rows = sqlx::query_as::<_, BlockedProfile>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to list blocked profiles")?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Cooperative chat locks
    // ------------------------------------------------------------------

    /// Lock the session rendering `page_url` for `locked_by` until
    /// now + ttl. Returns the updated row, or None when no such session.
    pub async fn lock_chat_by_url(
        &self,
        page_url: &str,
        locked_by: &str,
        ttl_seconds: i64,
    ) -> Result<Option<ChatSessionRow>> {
        let Some(session) = self.get_chat_session_by_url(page_url).await? else {
            return Ok(None);
        };

        let until = (Utc::now() + Duration::seconds(ttl_seconds))
            .to_rfc3339_opts(SecondsFormat::Micros, false);
        sqlx::query(
            "UPDATE chat_sessions SET locked_by = ?, locked_until = ?, updated_at = ? WHERE id = ?",
        )
        .bind(locked_by)
        .bind(&until)
        .bind(utc_now_iso())
        .bind(session.id)
        .execute(&self.pool)
        .await
        .context("failed to lock chat")?;

        Ok(self.get_chat_session_by_id(session.id).await?)
    }

    /// Only the original owner may unlock. Returns whether a lock was cleared.
    pub async fn unlock_chat_by_url(&self, page_url: &str, locked_by: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET locked_by = NULL, locked_until = NULL, updated_at = ? \
             WHERE page_url = ? AND locked_by = ?",
        )
        .bind(utc_now_iso())
        .bind(page_url)
        .bind(locked_by)
        .execute(&self.pool)
        .await
        .context("failed to unlock chat")?;
        Ok(result.rows_affected() > 0)
    }

    /// Containers with at least one chat still inside its lock TTL. The
    /// selector treats these as a blocklist.
    pub async fn list_locked_containers(&self) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT container_id FROM chat_sessions \
             WHERE locked_until IS NOT NULL AND locked_until > ? ORDER BY container_id ASC",
        )
        .bind(utc_now_iso())
        .fetch_all(&self.pool)
        .await
        .context("failed to list locked containers")?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Jobs and attempts
    // ------------------------------------------------------------------

    pub async fn insert_job_start(
        &self,
        job_id: &str,
        request_id: Option<&str>,
        prompt_id: &str,
        selected_prompt_id: &str,
        input_fingerprint: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, request_id, prompt_id, selected_prompt_id,
                decision_mode, fanout_requested, fanout_used,
                container_ids_json, input_fingerprint, status, started_at
            ) VALUES (?, ?, ?, ?, 'multi', 1, 1, '[]', ?, 'pending', ?)
            "#,
        )
        .bind(job_id)
        .bind(request_id)
        .bind(prompt_id)
        .bind(selected_prompt_id)
        .bind(input_fingerprint)
        .bind(utc_now_iso())
        .execute(&self.pool)
        .await
        .context("failed to insert job")?;
        Ok(())
    }

    pub async fn update_job_profile(
        &self,
        job_id: &str,
        profile_id: &str,
        socks_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET profile_id = ?, socks_id = ? WHERE job_id = ?")
            .bind(profile_id)
            .bind(socks_id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to update job profile")?;
        Ok(())
    }

    pub async fn set_job_selected_containers(
        &self,
        job_id: &str,
        container_ids: &[String],
    ) -> Result<()> {
        let json = serde_json::to_string(container_ids)?;
        sqlx::query("UPDATE jobs SET container_ids_json = ? WHERE job_id = ?")
            .bind(json)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to set job containers")?;
        Ok(())
    }

    pub async fn update_job_finish(
        &self,
        job_id: &str,
        status: &str,
        result_text: Option<&str>,
        result_raw: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                result_text = ?,
                result_raw = ?,
                error_code = ?,
                error_message = ?,
                finished_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(status)
        .bind(result_text)
        .bind(result_raw)
        .bind(error_code)
        .bind(error_message)
        .bind(utc_now_iso())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to finish job")?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read job")?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_job_attempt(
        &self,
        job_id: &str,
        container_id: &str,
        prompt_id: &str,
        profile_id: &str,
        socks_id: Option<&str>,
        chat_session_id: Option<i64>,
        chat_id: Option<&str>,
        page_url: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_attempts (
                job_id, container_id, prompt_id, profile_id, socks_id,
                chat_session_id, chat_id, page_url, status, started_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(job_id)
        .bind(container_id)
        .bind(prompt_id)
        .bind(profile_id)
        .bind(socks_id)
        .bind(chat_session_id)
        .bind(chat_id)
        .bind(page_url)
        .bind(utc_now_iso())
        .execute(&self.pool)
        .await
        .context("failed to create job attempt")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_job_attempt(
        &self,
        attempt_id: i64,
        status: &str,
        result_text: Option<&str>,
        result_raw: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_attempts SET
                status = ?,
                result_text = ?,
                result_raw = ?,
                error_code = ?,
                error_message = ?,
                finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(result_text)
        .bind(result_raw)
        .bind(error_code)
        .bind(error_message)
        .bind(utc_now_iso())
        .bind(attempt_id)
        .execute(&self.pool)
        .await
        .context("failed to finish job attempt")?;
        Ok(())
    }

    pub async fn list_job_attempts(&self, job_id: &str) -> Result<Vec<JobAttemptRow>> {
        let rows = sqlx::query_as::<_, JobAttemptRow>(
            "SELECT * FROM job_attempts WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list job attempts")?;
        Ok(rows)
    }
}
