//! SQLite storage backend.
//!
//! A file-backed relational store. The connection is shared behind an
//! async mutex, so writes serialize through the lock and the store can be
//! called concurrently from independent tasks; WAL mode lets other
//! processes read in parallel.
//!
//! The query planner lives in `load_contexts`/`search_contexts`: when a
//! tag filter is present, candidate ids are resolved through the tag
//! index first and the importance threshold is applied as a post-filter;
//! otherwise all filters run in a single SQL statement.

use crate::config::SqliteConfig;
use crate::error::{Error, Result};
use crate::model::{
    sort_newest_first, Context, PopularTag, ProjectInfo, SearchFilters, StorageStats, TagPattern,
    STATUS_ACTIVE,
};
use crate::project::normalize_project_filter;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{analytics, schema, tags};

/// SQLite-based storage backend.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

/// Render a timestamp in the fixed storage format (RFC 3339, UTC,
/// microsecond precision). Lexicographic order equals chronological
/// order, which the SQL `ORDER BY created_at` clauses rely on.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, tolerating missing offsets from older rows.
#[must_use]
pub fn parse_timestamp_opt(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Columns selected for every context read; `map_context_row` must match.
const CONTEXT_COLUMNS: &str =
    "id, project_id, content, importance_level, status, created_at, expires_at";

fn map_context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Context> {
    let id: i64 = row.get(0)?;
    let created_raw: String = row.get(5)?;
    let expires_raw: Option<String> = row.get(6)?;
    Ok(Context {
        id: id.to_string(),
        project_id: row.get(1)?,
        content: row.get(2)?,
        importance_level: row.get(3)?,
        status: row
            .get::<_, Option<String>>(4)?
            .unwrap_or_else(|| STATUS_ACTIVE.to_string()),
        tags: Vec::new(),
        created_at: parse_timestamp(&created_raw, 5)?,
        expires_at: expires_raw.as_deref().and_then(parse_timestamp_opt),
    })
}

/// Validate the caller-supplied importance rating.
fn validate_importance(importance_level: i64) -> Result<()> {
    if (1..=10).contains(&importance_level) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "importance_level must be between 1 and 10, got {importance_level}"
    )))
}

impl SqliteStorage {
    /// Open (or create) a database at the configured path.
    ///
    /// Initialization is lazy in the sense that the first operation
    /// against a missing file creates it with the expected schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_secs_f64(config.timeout))?;
        schema::apply_schema(&conn, &config.journal_mode)?;

        info!(path = %config.path.display(), journal_mode = %config.journal_mode, "sqlite storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: config.path.clone(),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn, "MEMORY")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Context ids bearing a specific tag, newest first, optionally
    /// project-scoped.
    pub async fn find_contexts_by_tag(
        &self,
        tag_name: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let project = normalize_project_filter(project_id);
        let conn = self.conn.lock().await;
        let ids =
            tags::find_context_ids_by_tag(&conn, tag_name, project.as_deref(), usize::MAX >> 1)?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    /// Popular tags with an explicit recent-tag window (hours). The trait
    /// method uses [`tags::RECENT_TAG_HOURS`].
    pub async fn popular_tags_with_window(
        &self,
        limit: usize,
        min_usage: u64,
        recent_hours: i64,
        project_id: Option<&str>,
    ) -> Result<Vec<PopularTag>> {
        let project = normalize_project_filter(project_id);
        let conn = self.conn.lock().await;
        tags::get_popular_tags(&conn, limit, min_usage, recent_hours, project.as_deref())
    }

    /// Parse an opaque id into a row id. Non-numeric ids cannot exist in
    /// this backend, so they resolve to "not found" rather than an error.
    fn parse_id(context_id: &str) -> Option<i64> {
        context_id.trim().parse().ok()
    }

    /// Single filtered SELECT over contexts (the no-tag-filter plan).
    fn query_contexts(
        conn: &Connection,
        project_id: Option<&str>,
        importance_min: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Context>> {
        let mut sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE importance_level >= ?"
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(importance_min)];

        if let Some(project) = project_id {
            sql.push_str(" AND project_id = ?");
            params.push(Box::new(project.to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        params.push(Box::new(limit as i64));
        params.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let contexts = stmt
            .query_map(param_refs.as_slice(), map_context_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contexts)
    }

    /// One `WHERE id IN (...)` query; missing ids are silently skipped.
    fn query_contexts_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<Context>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE id IN ({placeholders})
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let contexts = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), map_context_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contexts)
    }

    /// Attach tags to a context batch in a single round-trip.
    fn attach_tags(conn: &Connection, contexts: &mut [Context]) -> Result<()> {
        let ids: Vec<i64> = contexts
            .iter()
            .filter_map(|c| c.id.parse().ok())
            .collect();
        let mut batch = tags::load_context_tags_batch(conn, &ids)?;
        for context in contexts {
            if let Ok(id) = context.id.parse::<i64>() {
                context.tags = batch.remove(&id).unwrap_or_default();
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn raw_conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        // Schema is already applied by open(); indexes are performance,
        // not correctness, so their failures do not abort startup.
        schema::create_performance_indexes(&conn);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.lock().await;
        match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "sqlite health check failed");
                false
            }
        }
    }

    async fn save_context(
        &self,
        content: &str,
        importance_level: i64,
        project_id: Option<&str>,
        tags_list: &[String],
    ) -> Result<String> {
        validate_importance(importance_level)?;
        let project = normalize_project_filter(project_id);
        let created_at = format_timestamp(&Utc::now());

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO contexts (project_id, content, importance_level, status, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4)",
            rusqlite::params![project, content, importance_level, created_at],
        )?;
        let context_id = tx.last_insert_rowid();
        tags::save_context_tags(&tx, context_id, tags_list)?;
        tx.commit()?;

        debug!(context_id, project = project.as_deref(), "context saved");
        Ok(context_id.to_string())
    }

    async fn load_context(&self, context_id: &str) -> Result<Option<Context>> {
        let Some(id) = Self::parse_id(context_id) else {
            return Ok(None);
        };
        let conn = self.conn.lock().await;
        let mut contexts = Self::query_contexts_by_ids(&conn, &[id])?;
        Self::attach_tags(&conn, &mut contexts)?;
        Ok(contexts.pop())
    }

    async fn load_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
        importance_threshold: i64,
        tags_filter: Option<&[String]>,
    ) -> Result<Vec<Context>> {
        let project = normalize_project_filter(project_id);
        let conn = self.conn.lock().await;

        let filter = tags_filter.map(tags::normalize_tags).unwrap_or_default();
        if filter.is_empty() {
            let mut contexts =
                Self::query_contexts(&conn, project.as_deref(), importance_threshold, limit, 0)?;
            Self::attach_tags(&conn, &mut contexts)?;
            return Ok(contexts);
        }

        // Tag plan: resolve candidates through the tag index, then load by
        // id, post-filter by importance, and re-sort.
        let ids =
            tags::find_context_ids_by_multiple_tags(&conn, &filter, project.as_deref(), limit)?;
        let mut contexts = Self::query_contexts_by_ids(&conn, &ids)?;
        Self::attach_tags(&conn, &mut contexts)?;
        contexts.retain(|c| c.importance_level >= importance_threshold);
        sort_newest_first(&mut contexts);
        contexts.truncate(limit);
        Ok(contexts)
    }

    async fn load_contexts_by_ids(&self, context_ids: &[String]) -> Result<Vec<Context>> {
        let ids: Vec<i64> = context_ids
            .iter()
            .filter_map(|id| Self::parse_id(id))
            .collect();
        let conn = self.conn.lock().await;
        let mut contexts = Self::query_contexts_by_ids(&conn, &ids)?;
        Self::attach_tags(&conn, &mut contexts)?;
        Ok(contexts)
    }

    async fn update_context(
        &self,
        context_id: &str,
        content: Option<&str>,
        importance_level: Option<i64>,
    ) -> Result<bool> {
        let Some(id) = Self::parse_id(context_id) else {
            return Ok(false);
        };
        if let Some(level) = importance_level {
            validate_importance(level)?;
        }
        if content.is_none() && importance_level.is_none() {
            return Ok(false);
        }

        let conn = self.conn.lock().await;

        let mut set_parts: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(text) = content {
            set_parts.push("content = ?");
            params.push(Box::new(text.to_string()));
        }
        if let Some(level) = importance_level {
            set_parts.push("importance_level = ?");
            params.push(Box::new(level));
        }
        params.push(Box::new(id));

        let sql = format!(
            "UPDATE contexts SET {} WHERE id = ?",
            set_parts.join(", ")
        );
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let rows = conn.execute(&sql, param_refs.as_slice())?;
        Ok(rows > 0)
    }

    async fn delete_context(&self, context_id: &str) -> Result<bool> {
        let Some(id) = Self::parse_id(context_id) else {
            return Ok(false);
        };
        let conn = self.conn.lock().await;
        // Foreign keys are on, so linkages cascade with the row.
        let rows = conn.execute("DELETE FROM contexts WHERE id = ?1", [id])?;
        if rows > 0 {
            debug!(context_id = id, "context deleted");
        }
        Ok(rows > 0)
    }

    async fn search_contexts(&self, filters: &SearchFilters) -> Result<Vec<Context>> {
        let project = normalize_project_filter(filters.project_id.as_deref());
        let conn = self.conn.lock().await;

        let tag_filter = tags::normalize_tags(&filters.tags);
        let mut contexts = if tag_filter.is_empty() {
            // All filters in SQL.
            let mut sql = format!(
                "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE importance_level >= ?"
            );
            let mut params: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(filters.min_importance)];
            if let Some(ref p) = project {
                sql.push_str(" AND project_id = ?");
                params.push(Box::new(p.clone()));
            }
            if let Some(ref needle) = filters.content_search {
                sql.push_str(" AND content LIKE ?");
                params.push(Box::new(format!("%{needle}%")));
            }
            sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
            params.push(Box::new(filters.limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|b| b.as_ref()).collect();
            stmt.query_map(param_refs.as_slice(), map_context_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            // Tag plan with an oversized candidate set, filtered in memory.
            let ids = tags::find_context_ids_by_multiple_tags(
                &conn,
                &tag_filter,
                project.as_deref(),
                filters.limit.saturating_mul(2),
            )?;
            let mut candidates = Self::query_contexts_by_ids(&conn, &ids)?;
            candidates.retain(|c| c.importance_level >= filters.min_importance);
            if let Some(ref needle) = filters.content_search {
                let needle = needle.to_lowercase();
                candidates.retain(|c| c.content.to_lowercase().contains(&needle));
            }
            sort_newest_first(&mut candidates);
            candidates.truncate(filters.limit);
            candidates
        };

        Self::attach_tags(&conn, &mut contexts)?;
        Ok(contexts)
    }

    async fn get_context_tags(&self, context_id: &str) -> Result<Vec<String>> {
        let Some(id) = Self::parse_id(context_id) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock().await;
        tags::load_context_tags(&conn, id)
    }

    async fn add_context_tag(&self, context_id: &str, tag: &str) -> Result<bool> {
        let Some(id) = Self::parse_id(context_id) else {
            return Ok(false);
        };
        let conn = self.conn.lock().await;
        let exists: bool = conn
            .prepare("SELECT 1 FROM contexts WHERE id = ?1")?
            .exists([id])?;
        if !exists {
            return Ok(false);
        }
        tags::save_context_tags(&conn, id, &[tag.to_string()])?;
        Ok(true)
    }

    async fn get_popular_tags(
        &self,
        limit: usize,
        min_usage: u64,
        project_id: Option<&str>,
    ) -> Result<Vec<PopularTag>> {
        self.popular_tags_with_window(limit, min_usage, tags::RECENT_TAG_HOURS, project_id)
            .await
    }

    async fn find_contexts_by_multiple_tags(
        &self,
        tag_names: &[String],
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Context>> {
        let project = normalize_project_filter(project_id);
        let conn = self.conn.lock().await;
        let ids =
            tags::find_context_ids_by_multiple_tags(&conn, tag_names, project.as_deref(), limit)?;
        let mut contexts = Self::query_contexts_by_ids(&conn, &ids)?;
        Self::attach_tags(&conn, &mut contexts)?;
        Ok(contexts)
    }

    async fn list_all_projects_global(&self) -> Result<Vec<ProjectInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT project_id, COUNT(*) FROM contexts
             WHERE project_id IS NOT NULL
             GROUP BY project_id
             ORDER BY project_id",
        )?;
        let projects = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                Ok(ProjectInfo {
                    name: id.clone(),
                    id,
                    context_count: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    async fn get_storage_stats(&self) -> Result<StorageStats> {
        let conn = self.conn.lock().await;
        analytics::storage_stats(&conn, &self.path)
    }

    async fn analyze_tag_patterns(&self, limit: usize) -> Result<Vec<TagPattern>> {
        let conn = self.conn.lock().await;
        analytics::analyze_tag_patterns(&conn, limit)
    }

    async fn count_contexts(&self, project_id: Option<&str>) -> Result<u64> {
        let project = normalize_project_filter(project_id);
        let conn = self.conn.lock().await;
        let count: i64 = if let Some(p) = project {
            conn.query_row(
                "SELECT COUNT(*) FROM contexts WHERE project_id = ?1",
                [p],
                |row| row.get(0),
            )?
        } else {
            conn.query_row("SELECT COUNT(*) FROM contexts", [], |row| row.get(0))?
        };
        Ok(count.max(0) as u64)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = format_timestamp(&Utc::now());
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM contexts WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now],
        )?;
        if removed > 0 {
            info!(removed, "expired contexts cleaned up");
        }
        Ok(removed)
    }

    async fn cleanup_unused_tags(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = tags::cleanup_unused_tags(&conn)?;
        if removed > 0 {
            info!(removed, "unused tags cleaned up");
        }
        Ok(removed)
    }

    async fn close(&self) {
        // Connections close on drop; WAL checkpoints happen automatically.
        debug!(path = %self.path.display(), "sqlite storage closing");
    }
}
