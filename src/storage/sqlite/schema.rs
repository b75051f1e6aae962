//! Database schema definitions for the SQLite backend.
//!
//! Three tables: `contexts` holds the artifacts, `tags` is the tag
//! dictionary (one row per distinct name), and `context_tags` links them.
//! Deleting a context cascades its linkages; dictionary rows are only
//! removed by `cleanup_unused_tags`.

use rusqlite::Connection;
use tracing::{debug, warn};

/// The complete SQL schema for the MemVault database.
///
/// Timestamps are stored as ISO-8601 UTC text; the fixed format keeps
/// lexicographic and chronological ordering identical.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contexts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT,
    content TEXT NOT NULL,
    importance_level INTEGER NOT NULL CHECK (importance_level BETWEEN 1 AND 10),
    status TEXT DEFAULT 'active',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    expires_at TIMESTAMP,
    access_count INTEGER DEFAULT 0,
    last_accessed TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS context_tags (
    context_id INTEGER NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (context_id, tag_id),
    FOREIGN KEY (context_id) REFERENCES contexts(id) ON DELETE CASCADE,
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);
";

/// Performance indexes created during initialization.
///
/// These are performance, not correctness: a failure to create one is
/// logged and initialization continues.
pub const PERFORMANCE_INDEXES: &[&str] = &[
    // Core context indexes for fast filtering
    "CREATE INDEX IF NOT EXISTS idx_contexts_project_created ON contexts(project_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_contexts_project_importance ON contexts(project_id, importance_level)",
    "CREATE INDEX IF NOT EXISTS idx_contexts_importance ON contexts(importance_level)",
    "CREATE INDEX IF NOT EXISTS idx_contexts_created_at ON contexts(created_at)",
    // Tag relationship indexes for JOIN optimization
    "CREATE INDEX IF NOT EXISTS idx_context_tags_tag_id ON context_tags(tag_id)",
    "CREATE INDEX IF NOT EXISTS idx_context_tags_context_id ON context_tags(context_id)",
    "CREATE INDEX IF NOT EXISTS idx_context_tags_composite ON context_tags(tag_id, context_id)",
    // Tag lookup index
    "CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name)",
    // Project isolation index
    "CREATE INDEX IF NOT EXISTS idx_contexts_project_id ON contexts(project_id)",
];

/// Apply pragmas and the schema to a fresh connection.
///
/// Idempotent: all statements use `IF NOT EXISTS`. Foreign-key enforcement
/// must be on for delete cascades, so it is set here on every connection.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection, journal_mode: &str) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", journal_mode)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Create the performance index set.
///
/// Individual failures are logged at WARN and skipped; the store stays
/// usable without them.
pub fn create_performance_indexes(conn: &Connection) {
    let mut created = 0usize;
    for index_sql in PERFORMANCE_INDEXES {
        match conn.execute(index_sql, []) {
            Ok(_) => created += 1,
            Err(e) => warn!(error = %e, sql = %index_sql, "failed to create performance index"),
        }
    }
    debug!(created, total = PERFORMANCE_INDEXES.len(), "performance indexes ready");
}
