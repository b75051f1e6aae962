//! Data models for MemVault.
//!
//! This module contains the domain types shared by both storage backends:
//! the stored [`Context`] artifact and the derived records produced by
//! queries and analytics ([`PopularTag`], [`ProjectInfo`], [`StorageStats`],
//! [`TagPattern`], [`InitContexts`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status value for contexts the core produces.
///
/// Other values are reserved; the core reads them only for filtering.
pub const STATUS_ACTIVE: &str = "active";

/// A single stored memory artifact.
///
/// `id` is opaque to callers: the SQLite backend assigns monotonically
/// increasing integers (rendered as strings), the Redis backend uses UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Backend-assigned identifier, stable within a backend.
    pub id: String,

    /// Normalized owning project, or `None` for global/cross-project.
    pub project_id: Option<String>,

    /// Arbitrary UTF-8 text; no length ceiling enforced.
    pub content: String,

    /// Caller-judged importance, 1..=10 inclusive.
    pub importance_level: i64,

    /// Lifecycle status; the core only ever writes `"active"`.
    #[serde(default = "default_status")]
    pub status: String,

    /// Normalized tags (lowercased, trimmed, unique).
    #[serde(default)]
    pub tags: Vec<String>,

    /// Save timestamp, ISO-8601 UTC.
    pub created_at: DateTime<Utc>,

    /// Optional expiry; preserved on round-trip, unused by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_status() -> String {
    STATUS_ACTIVE.to_string()
}

/// A tag with its usage count, produced by popular-tag queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularTag {
    pub tag: String,
    pub count: u64,
}

/// A project derived from distinct `project_id` values in contexts.
///
/// Not a first-class persisted entity; `name` mirrors `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub context_count: u64,
}

/// One bucket of the importance histogram in [`StorageStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportanceBucket {
    pub level: i64,
    pub count: u64,
}

/// Storage statistics for monitoring.
///
/// `size_bytes` is the database file size for SQLite and Redis
/// `used_memory` for the key-value backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub provider: String,
    pub active_contexts: u64,
    pub active_projects: u64,
    pub total_tags: u64,
    pub size_bytes: u64,
    pub oldest_context: Option<DateTime<Utc>>,
    pub newest_context: Option<DateTime<Utc>>,
    pub importance_levels: Vec<ImportanceBucket>,
}

/// Aggregated tag usage produced by `analyze_tag_patterns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPattern {
    pub tag: String,
    pub usage_count: u64,
    pub avg_importance: f64,
    pub latest_usage: Option<DateTime<Utc>>,
    pub project_count: u64,
}

/// Filters accepted by `search_contexts`.
///
/// `content_search` is a reserved substring post-filter hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_min_importance")]
    pub min_importance: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_search: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_min_importance() -> i64 {
    1
}

fn default_search_limit() -> usize {
    100
}

/// Metadata attached to an init-load result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitMetadata {
    pub project_id: Option<String>,
    pub context_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// The session-initialization package: operator instruction plus the
/// smart-loaded context slab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitContexts {
    pub init_instruction: String,
    pub contexts: Vec<Context>,
    pub metadata: InitMetadata,
}

impl Context {
    /// Sort key for bulk reads: `created_at DESC, id DESC`.
    ///
    /// The id tie-break keeps ordering deterministic under equal
    /// timestamps. SQLite ids compare numerically; Redis UUIDs fall back
    /// to lexicographic comparison.
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, IdOrd<'_>) {
        (self.created_at, IdOrd(&self.id))
    }
}

/// Ordering wrapper that compares numeric ids numerically and everything
/// else lexicographically.
#[derive(Debug)]
pub struct IdOrd<'a>(pub &'a str);

impl Ord for IdOrd<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.parse::<i64>(), other.0.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self.0.cmp(other.0),
        }
    }
}

impl PartialOrd for IdOrd<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IdOrd<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for IdOrd<'_> {}

/// Sort contexts in the bulk-read order: `created_at DESC, id DESC`.
pub fn sort_newest_first(contexts: &mut [Context]) {
    contexts.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
}

/// Normalize a raw tag: trim and lowercase. Tag comparison is
/// case-insensitive everywhere; storage is lowercase.
#[must_use]
pub fn normalize_tag(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalize a tag list, dropping empties and duplicates while keeping
/// first-seen order.
#[must_use]
pub fn normalize_tags(raw: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .map(|t| normalize_tag(t))
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
