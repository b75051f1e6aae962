//! Statistics and tag-pattern analytics for the SQLite backend.

use crate::error::Result;
use crate::model::{ImportanceBucket, StorageStats, TagPattern};
use rusqlite::Connection;
use std::path::Path;

use super::store::parse_timestamp_opt;

/// Gather storage statistics in a handful of aggregate queries.
///
/// `size_bytes` is the database file size; WAL sidecars are not included.
pub fn storage_stats(conn: &Connection, db_path: &Path) -> Result<StorageStats> {
    let active_contexts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contexts WHERE status = 'active'",
        [],
        |row| row.get(0),
    )?;

    let active_projects: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT project_id) FROM contexts WHERE project_id IS NOT NULL",
        [],
        |row| row.get(0),
    )?;

    let total_tags: i64 = conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?;

    let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM contexts WHERE status = 'active'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT importance_level, COUNT(*) FROM contexts
         WHERE status = 'active'
         GROUP BY importance_level
         ORDER BY importance_level DESC",
    )?;
    let importance_levels = stmt
        .query_map([], |row| {
            Ok(ImportanceBucket {
                level: row.get(0)?,
                count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    Ok(StorageStats {
        provider: "sqlite".to_string(),
        active_contexts: active_contexts.max(0) as u64,
        active_projects: active_projects.max(0) as u64,
        total_tags: total_tags.max(0) as u64,
        size_bytes,
        oldest_context: oldest.as_deref().and_then(parse_timestamp_opt),
        newest_context: newest.as_deref().and_then(parse_timestamp_opt),
        importance_levels,
    })
}

/// Aggregate tag usage across active contexts.
///
/// One query joining tags to contexts, ordered by usage then latest use.
pub fn analyze_tag_patterns(conn: &Connection, limit: usize) -> Result<Vec<TagPattern>> {
    let mut stmt = conn.prepare(
        "SELECT
            t.name,
            COUNT(ct.context_id) AS usage_count,
            AVG(c.importance_level) AS avg_importance,
            MAX(c.created_at) AS latest_usage,
            COUNT(DISTINCT c.project_id) AS project_count
         FROM tags t
         JOIN context_tags ct ON t.id = ct.tag_id
         JOIN contexts c ON ct.context_id = c.id
         WHERE c.status = 'active'
         GROUP BY t.id, t.name
         ORDER BY usage_count DESC, latest_usage DESC
         LIMIT ?1",
    )?;

    let patterns = stmt
        .query_map([limit as i64], |row| {
            Ok(TagPattern {
                tag: row.get(0)?,
                usage_count: row.get::<_, i64>(1)?.max(0) as u64,
                avg_importance: row.get::<_, f64>(2)?,
                latest_usage: row
                    .get::<_, Option<String>>(3)?
                    .as_deref()
                    .and_then(parse_timestamp_opt),
                project_count: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::schema::apply_schema;
    use crate::storage::sqlite::tags::save_context_tags;
    use chrono::Utc;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn, "WAL").unwrap();
        conn
    }

    fn insert(conn: &Connection, project: Option<&str>, importance: i64, tags: &[&str]) -> i64 {
        conn.execute(
            "INSERT INTO contexts (project_id, content, importance_level, created_at)
             VALUES (?1, 'c', ?2, ?3)",
            rusqlite::params![
                project,
                importance,
                super::super::store::format_timestamp(&Utc::now())
            ],
        )
        .unwrap();
        let id = conn.last_insert_rowid();
        let owned: Vec<String> = tags.iter().map(ToString::to_string).collect();
        save_context_tags(conn, id, &owned).unwrap();
        id
    }

    #[test]
    fn stats_count_contexts_projects_and_tags() {
        let conn = test_conn();
        insert(&conn, Some("a"), 9, &["x"]);
        insert(&conn, Some("a"), 3, &["x", "y"]);
        insert(&conn, None, 5, &[]);

        let stats = storage_stats(&conn, Path::new("/nonexistent")).unwrap();
        assert_eq!(stats.provider, "sqlite");
        assert_eq!(stats.active_contexts, 3);
        assert_eq!(stats.active_projects, 1);
        assert_eq!(stats.total_tags, 2);
        assert!(stats.oldest_context.is_some());
        assert!(stats.newest_context.is_some());
        assert_eq!(
            stats.importance_levels.iter().map(|b| b.count).sum::<u64>(),
            3
        );
    }

    #[test]
    fn tag_patterns_aggregate_usage() {
        let conn = test_conn();
        insert(&conn, Some("a"), 8, &["hot"]);
        insert(&conn, Some("b"), 6, &["hot"]);
        insert(&conn, Some("a"), 2, &["cold"]);

        let patterns = analyze_tag_patterns(&conn, 10).unwrap();
        assert_eq!(patterns[0].tag, "hot");
        assert_eq!(patterns[0].usage_count, 2);
        assert_eq!(patterns[0].project_count, 2);
        assert!((patterns[0].avg_importance - 7.0).abs() < f64::EPSILON);
        assert_eq!(patterns[1].tag, "cold");
    }
}
