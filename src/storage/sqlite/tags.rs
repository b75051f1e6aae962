//! Tag repository for the SQLite backend.
//!
//! All helpers take a `&Connection` so they run equally inside a
//! transaction (which derefs to a connection) or under the store's
//! connection lock. Tag names are normalized to trimmed lowercase before
//! they touch the dictionary.
//!
//! The batch loader is the heart of the N+1 fix: every multi-context read
//! path attaches tags through [`load_context_tags_batch`], one `IN` query
//! for the whole result set.

use crate::error::Result;
use crate::model::PopularTag;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::collections::HashMap;

pub use crate::model::{normalize_tag, normalize_tags};

/// Hours within which a single-use tag still counts as "popular".
pub const RECENT_TAG_HOURS: i64 = 24;

/// Attach tags to a context: `INSERT OR IGNORE` into the dictionary, then
/// `INSERT OR IGNORE` the linkage. Safe to call repeatedly.
pub fn save_context_tags(conn: &Connection, context_id: i64, tags: &[String]) -> Result<()> {
    for tag in normalize_tags(tags) {
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", [&tag])?;
        conn.execute(
            "INSERT OR IGNORE INTO context_tags (context_id, tag_id)
             SELECT ?1, id FROM tags WHERE name = ?2",
            rusqlite::params![context_id, tag],
        )?;
    }
    Ok(())
}

/// Load tags for a single context, sorted by name.
pub fn load_context_tags(conn: &Connection, context_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT t.name FROM tags t
         JOIN context_tags ct ON t.id = ct.tag_id
         WHERE ct.context_id = ?1
         ORDER BY t.name",
    )?;
    let tags = stmt
        .query_map([context_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tags)
}

/// Load tags for many contexts in a single `IN` query.
///
/// Every requested id appears in the result map, empty-tagged contexts
/// included, so callers can attach unconditionally.
pub fn load_context_tags_batch(
    conn: &Connection,
    context_ids: &[i64],
) -> Result<HashMap<i64, Vec<String>>> {
    let mut by_context: HashMap<i64, Vec<String>> =
        context_ids.iter().map(|id| (*id, Vec::new())).collect();
    if context_ids.is_empty() {
        return Ok(by_context);
    }

    let placeholders = vec!["?"; context_ids.len()].join(", ");
    let sql = format!(
        "SELECT ct.context_id, t.name
         FROM context_tags ct
         JOIN tags t ON ct.tag_id = t.id
         WHERE ct.context_id IN ({placeholders})
         ORDER BY ct.context_id, t.name"
    );

    let mut stmt = conn.prepare(&sql)?;
    let params = rusqlite::params_from_iter(context_ids.iter());
    let rows = stmt.query_map(params, |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (context_id, name) = row?;
        by_context.entry(context_id).or_default().push(name);
    }
    Ok(by_context)
}

/// Context ids bearing a specific tag, newest context first, optionally
/// scoped to a project.
pub fn find_context_ids_by_tag(
    conn: &Connection,
    tag_name: &str,
    project_id: Option<&str>,
    limit: usize,
) -> Result<Vec<i64>> {
    let tag = normalize_tag(tag_name);
    let ids = if let Some(project) = project_id {
        let mut stmt = conn.prepare(
            "SELECT ct.context_id FROM context_tags ct
             JOIN tags t ON ct.tag_id = t.id
             JOIN contexts c ON ct.context_id = c.id
             WHERE t.name = ?1 AND c.project_id = ?2
             ORDER BY ct.context_id DESC
             LIMIT ?3",
        )?;
        stmt.query_map(rusqlite::params![tag, project, limit as i64], |row| {
            row.get(0)
        })?
        .collect::<rusqlite::Result<Vec<i64>>>()?
    } else {
        let mut stmt = conn.prepare(
            "SELECT ct.context_id FROM context_tags ct
             JOIN tags t ON ct.tag_id = t.id
             WHERE t.name = ?1
             ORDER BY ct.context_id DESC
             LIMIT ?2",
        )?;
        stmt.query_map(rusqlite::params![tag, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?
    };
    Ok(ids)
}

/// Context ids bearing ANY of the given tags (OR semantics), newest
/// context first, optionally scoped to a project.
pub fn find_context_ids_by_multiple_tags(
    conn: &Connection,
    tags: &[String],
    project_id: Option<&str>,
    limit: usize,
) -> Result<Vec<i64>> {
    let normalized = normalize_tags(tags);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; normalized.len()].join(", ");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = normalized
        .iter()
        .map(|t| Box::new(t.clone()) as Box<dyn rusqlite::ToSql>)
        .collect();

    let sql = if let Some(project) = project_id {
        params.push(Box::new(project.to_string()));
        params.push(Box::new(limit as i64));
        format!(
            "SELECT DISTINCT ct.context_id FROM context_tags ct
             JOIN tags t ON ct.tag_id = t.id
             JOIN contexts c ON ct.context_id = c.id
             WHERE t.name IN ({placeholders}) AND c.project_id = ?
             ORDER BY ct.context_id DESC
             LIMIT ?"
        )
    } else {
        params.push(Box::new(limit as i64));
        format!(
            "SELECT DISTINCT ct.context_id FROM context_tags ct
             JOIN tags t ON ct.tag_id = t.id
             WHERE t.name IN ({placeholders})
             ORDER BY ct.context_id DESC
             LIMIT ?"
        )
    };

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let ids = stmt
        .query_map(param_refs.as_slice(), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Popular and recently used tags in one aggregation query.
///
/// A tag qualifies when its usage count reaches `min_usage`, or when it
/// was used exactly once within the last `recent_hours`. Ordered by usage
/// count, then latest use, both descending.
pub fn get_popular_tags(
    conn: &Connection,
    limit: usize,
    min_usage: u64,
    recent_hours: i64,
    project_id: Option<&str>,
) -> Result<Vec<PopularTag>> {
    let cutoff = recent_cutoff(recent_hours);

    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    let project_clause = if let Some(project) = project_id {
        params.push(Box::new(project.to_string()));
        "WHERE c.project_id = ?"
    } else {
        ""
    };
    params.push(Box::new(min_usage as i64));
    params.push(Box::new(cutoff));
    params.push(Box::new(limit as i64));

    let sql = format!(
        "SELECT t.name, COUNT(ct.context_id) AS usage_count, MAX(c.created_at) AS latest_use
         FROM tags t
         JOIN context_tags ct ON t.id = ct.tag_id
         JOIN contexts c ON ct.context_id = c.id
         {project_clause}
         GROUP BY t.id, t.name
         HAVING usage_count >= ? OR (usage_count = 1 AND latest_use > ?)
         ORDER BY usage_count DESC, latest_use DESC
         LIMIT ?"
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let tags = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(PopularTag {
                tag: row.get(0)?,
                count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

/// Remove dictionary entries no context links to. Returns the number
/// removed.
pub fn cleanup_unused_tags(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM context_tags)",
        [],
    )?;
    Ok(removed)
}

/// ISO-8601 cutoff string for the recent-tag window.
///
/// Timestamps are stored in a fixed RFC 3339 format, so a plain string
/// comparison in SQL is chronologically correct.
fn recent_cutoff(recent_hours: i64) -> String {
    let cutoff: DateTime<Utc> = Utc::now() - Duration::hours(recent_hours.max(0));
    super::store::format_timestamp(&cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::schema::apply_schema;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn, "WAL").unwrap();
        conn
    }

    fn insert_context(conn: &Connection, project: Option<&str>, importance: i64) -> i64 {
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
        conn.last_insert_rowid()
    }

    #[test]
    fn tags_are_normalized_and_deduplicated() {
        let conn = test_conn();
        let id = insert_context(&conn, None, 5);
        save_context_tags(
            &conn,
            id,
            &["  Rust ".into(), "rust".into(), String::new(), "db".into()],
        )
        .unwrap();

        let tags = load_context_tags(&conn, id).unwrap();
        assert_eq!(tags, vec!["db".to_string(), "rust".to_string()]);

        let dict: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dict, 2);
    }

    #[test]
    fn dictionary_entry_is_unique_across_contexts() {
        let conn = test_conn();
        let a = insert_context(&conn, None, 5);
        let b = insert_context(&conn, None, 5);
        save_context_tags(&conn, a, &["shared".into()]).unwrap();
        save_context_tags(&conn, b, &["shared".into()]).unwrap();

        let dict: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dict, 1);
    }

    #[test]
    fn batch_load_covers_all_requested_ids() {
        let conn = test_conn();
        let a = insert_context(&conn, None, 5);
        let b = insert_context(&conn, None, 5);
        save_context_tags(&conn, a, &["x".into(), "y".into()]).unwrap();

        let batch = load_context_tags_batch(&conn, &[a, b, 999]).unwrap();
        assert_eq!(batch[&a], vec!["x".to_string(), "y".to_string()]);
        assert!(batch[&b].is_empty());
        assert!(batch[&999].is_empty());
    }

    #[test]
    fn multi_tag_or_matches_single_tag_query() {
        let conn = test_conn();
        let a = insert_context(&conn, Some("p"), 5);
        let b = insert_context(&conn, Some("p"), 5);
        let c = insert_context(&conn, Some("q"), 5);
        save_context_tags(&conn, a, &["t".into()]).unwrap();
        save_context_tags(&conn, b, &["t".into(), "u".into()]).unwrap();
        save_context_tags(&conn, c, &["t".into()]).unwrap();

        let single = find_context_ids_by_tag(&conn, "t", Some("p"), 100).unwrap();
        let multi =
            find_context_ids_by_multiple_tags(&conn, &["t".into()], Some("p"), 100).unwrap();
        assert_eq!(single, multi);
        assert_eq!(single, vec![b, a]);

        let global = find_context_ids_by_tag(&conn, "t", None, 100).unwrap();
        assert_eq!(global, vec![c, b, a]);
    }

    #[test]
    fn popular_tags_respect_min_usage_and_recency() {
        let conn = test_conn();
        for _ in 0..3 {
            let id = insert_context(&conn, None, 5);
            save_context_tags(&conn, id, &["common".into()]).unwrap();
        }
        let fresh = insert_context(&conn, None, 5);
        save_context_tags(&conn, fresh, &["fresh".into()]).unwrap();

        // Age one single-use tag beyond the recent window.
        let old = insert_context(&conn, None, 5);
        save_context_tags(&conn, old, &["stale".into()]).unwrap();
        conn.execute(
            "UPDATE contexts SET created_at = '2000-01-01T00:00:00.000000Z' WHERE id = ?1",
            [old],
        )
        .unwrap();

        let popular = get_popular_tags(&conn, 10, 2, RECENT_TAG_HOURS, None).unwrap();
        let names: Vec<&str> = popular.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(popular[0].tag, "common");
        assert_eq!(popular[0].count, 3);
        assert!(names.contains(&"fresh"));
        assert!(!names.contains(&"stale"));
    }

    #[test]
    fn popular_tags_scoped_to_project() {
        let conn = test_conn();
        for _ in 0..2 {
            let id = insert_context(&conn, Some("a"), 5);
            save_context_tags(&conn, id, &["t".into()]).unwrap();
        }
        let other = insert_context(&conn, Some("b"), 5);
        save_context_tags(&conn, other, &["t".into()]).unwrap();

        let scoped = get_popular_tags(&conn, 10, 2, 0, Some("a")).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].count, 2);
    }

    #[test]
    fn cleanup_removes_only_orphaned_tags() {
        let conn = test_conn();
        let keep = insert_context(&conn, None, 5);
        save_context_tags(&conn, keep, &["kept".into()]).unwrap();
        let gone = insert_context(&conn, None, 5);
        save_context_tags(&conn, gone, &["orphan".into()]).unwrap();

        conn.execute("DELETE FROM contexts WHERE id = ?1", [gone]).unwrap();
        let removed = cleanup_unused_tags(&conn).unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<String> = conn
            .prepare("SELECT name FROM tags")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(remaining, vec!["kept".to_string()]);
    }
}
