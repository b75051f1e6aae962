//! Pluggable storage layer.
//!
//! Both backends implement the async [`Storage`] trait; dispatch goes
//! through the [`Backend`] enum selected by the connection descriptor.
//!
//! # Batching rule
//!
//! For any operation that returns multiple contexts, tag attachment for
//! the whole result set happens in **one** storage round-trip (a single
//! SQL `IN` query, or one MGET/pipeline). Per-context tag queries are a
//! correctness bug in this codebase, not an optimization choice.
//!
//! # Fail-fast initialization
//!
//! [`connect`] initializes the chosen backend and propagates any failure.
//! The host must never substitute a different backend: data silently
//! landing in the wrong store is worse than a crash.

pub mod redis;
pub mod sqlite;

pub use redis::RedisStorage;
pub use sqlite::SqliteStorage;

use crate::config::{self, ConnectionDescriptor};
use crate::error::Result;
use crate::instruction;
use crate::model::{
    sort_newest_first, Context, InitContexts, InitMetadata, PopularTag, ProjectInfo,
    SearchFilters, StorageStats, TagPattern,
};
use crate::project::normalize_project_filter;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use tracing::{error, info};

/// Importance floor for the init-time "high" slab.
pub const SMART_HIGH_IMPORTANCE_MIN: i64 = 7;
/// Size of the init-time "high" slab.
pub const SMART_HIGH_LIMIT: usize = 15;
/// Importance floor for the init-time "recent" slab.
pub const SMART_RECENT_IMPORTANCE_MIN: i64 = 4;
/// Size of the init-time "recent" slab.
pub const SMART_RECENT_LIMIT: usize = 20;
/// Age ceiling for the "recent" slab.
pub const SMART_RECENT_WINDOW_DAYS: i64 = 7;

/// Uniform async contract both backends satisfy.
///
/// Methods return typed errors; the tool-dispatch layer converts them to
/// user-facing sentinels, except configuration and permission errors,
/// which propagate.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Prepare the backend for use (schema, indexes, connectivity probe).
    /// Failures propagate; the host must not substitute a backend.
    async fn initialize(&self) -> Result<()>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;

    /// Persist a context and its tag linkages; returns the new id.
    async fn save_context(
        &self,
        content: &str,
        importance_level: i64,
        project_id: Option<&str>,
        tags: &[String],
    ) -> Result<String>;

    /// Load a single context with tags attached.
    async fn load_context(&self, context_id: &str) -> Result<Option<Context>>;

    /// Bulk read with the embedded query planner: tag filter first (OR
    /// semantics, project-scoped), otherwise all filters in one
    /// statement. Sorted `created_at DESC, id DESC`, truncated to
    /// `limit`, all tags batch-attached.
    async fn load_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
        importance_threshold: i64,
        tags_filter: Option<&[String]>,
    ) -> Result<Vec<Context>>;

    /// Batched id lookup: one context query plus one tag query,
    /// regardless of how many ids are requested. Missing ids are
    /// silently skipped.
    async fn load_contexts_by_ids(&self, context_ids: &[String]) -> Result<Vec<Context>>;

    /// Whole-record replace of the two nullable fields.
    async fn update_context(
        &self,
        context_id: &str,
        content: Option<&str>,
        importance_level: Option<i64>,
    ) -> Result<bool>;

    /// Delete a context and all its tag linkages atomically. Returns
    /// whether a record was removed.
    async fn delete_context(&self, context_id: &str) -> Result<bool>;

    /// Alias for [`delete_context`](Storage::delete_context).
    async fn forget_context(&self, context_id: &str) -> Result<bool> {
        self.delete_context(context_id).await
    }

    /// Filtered search; `content_search` is a reserved substring hook.
    async fn search_contexts(&self, filters: &SearchFilters) -> Result<Vec<Context>>;

    /// Tags for one context.
    async fn get_context_tags(&self, context_id: &str) -> Result<Vec<String>>;

    /// Attach one more tag to an existing context.
    async fn add_context_tag(&self, context_id: &str, tag: &str) -> Result<bool>;

    /// Popular tags: usage count at least `min_usage` (the SQLite backend
    /// additionally surfaces single-use tags fresher than its recent
    /// window), ordered by usage then recency/name.
    async fn get_popular_tags(
        &self,
        limit: usize,
        min_usage: u64,
        project_id: Option<&str>,
    ) -> Result<Vec<PopularTag>>;

    /// Contexts bearing ANY of the given tags (OR semantics).
    async fn find_contexts_by_multiple_tags(
        &self,
        tags: &[String],
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Context>>;

    /// All projects, derived from distinct `project_id` values.
    async fn list_all_projects_global(&self) -> Result<Vec<ProjectInfo>>;

    /// Monitoring statistics.
    async fn get_storage_stats(&self) -> Result<StorageStats>;

    /// Tag usage aggregation across active contexts.
    async fn analyze_tag_patterns(&self, limit: usize) -> Result<Vec<TagPattern>>;

    /// Count contexts, optionally project-scoped.
    async fn count_contexts(&self, project_id: Option<&str>) -> Result<u64>;

    /// Manual cleanup entry point for expired contexts. Returns the
    /// number removed.
    async fn cleanup_expired(&self) -> Result<usize>;

    /// Remove tag dictionary entries no context links to.
    async fn cleanup_unused_tags(&self) -> Result<usize>;

    /// Release backend resources.
    async fn close(&self);

    /// High-importance contexts across all projects.
    async fn load_high_importance_contexts(&self, limit: usize) -> Result<Vec<Context>> {
        self.load_contexts(None, limit, SMART_HIGH_IMPORTANCE_MIN, None)
            .await
    }

    /// Smart load for session initialization: the high-importance slab
    /// plus recent medium-importance activity, deduplicated and re-sorted
    /// newest first.
    async fn load_smart_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Context>> {
        let mut contexts = self
            .load_contexts(project_id, SMART_HIGH_LIMIT, SMART_HIGH_IMPORTANCE_MIN, None)
            .await?;
        let mut seen: HashSet<String> = contexts.iter().map(|c| c.id.clone()).collect();

        let recent = self
            .load_contexts(
                project_id,
                SMART_RECENT_LIMIT,
                SMART_RECENT_IMPORTANCE_MIN,
                None,
            )
            .await?;
        let cutoff = Utc::now() - Duration::days(SMART_RECENT_WINDOW_DAYS);
        for context in recent {
            if context.created_at >= cutoff && seen.insert(context.id.clone()) {
                contexts.push(context);
            }
        }

        sort_newest_first(&mut contexts);
        contexts.truncate(limit);
        Ok(contexts)
    }

    /// The session-initialization package: smart-loaded contexts plus the
    /// operator instruction. Instruction failures (including blocked
    /// paths) are logged and replaced by the minimal fallback so the
    /// contexts still reach the caller.
    async fn load_init_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<InitContexts> {
        let contexts = self.load_smart_contexts(project_id, limit).await?;

        let init_instruction = match instruction::load_custom_instruction().await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to load custom instruction, using fallback");
                instruction::FALLBACK_INSTRUCTION.to_string()
            }
        };

        Ok(InitContexts {
            metadata: InitMetadata {
                project_id: normalize_project_filter(project_id),
                context_count: contexts.len(),
                timestamp: Utc::now(),
            },
            init_instruction,
            contexts,
        })
    }
}

/// Enum-of-backends dispatch, selected by the connection descriptor.
#[derive(Debug, Clone)]
pub enum Backend {
    Sqlite(SqliteStorage),
    Redis(RedisStorage),
}

macro_rules! dispatch {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            Backend::Sqlite(store) => store.$method($($arg),*).await,
            Backend::Redis(store) => store.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl Storage for Backend {
    async fn initialize(&self) -> Result<()> {
        dispatch!(self.initialize())
    }

    async fn health_check(&self) -> bool {
        dispatch!(self.health_check())
    }

    async fn save_context(
        &self,
        content: &str,
        importance_level: i64,
        project_id: Option<&str>,
        tags: &[String],
    ) -> Result<String> {
        dispatch!(self.save_context(content, importance_level, project_id, tags))
    }

    async fn load_context(&self, context_id: &str) -> Result<Option<Context>> {
        dispatch!(self.load_context(context_id))
    }

    async fn load_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
        importance_threshold: i64,
        tags_filter: Option<&[String]>,
    ) -> Result<Vec<Context>> {
        dispatch!(self.load_contexts(project_id, limit, importance_threshold, tags_filter))
    }

    async fn load_contexts_by_ids(&self, context_ids: &[String]) -> Result<Vec<Context>> {
        dispatch!(self.load_contexts_by_ids(context_ids))
    }

    async fn update_context(
        &self,
        context_id: &str,
        content: Option<&str>,
        importance_level: Option<i64>,
    ) -> Result<bool> {
        dispatch!(self.update_context(context_id, content, importance_level))
    }

    async fn delete_context(&self, context_id: &str) -> Result<bool> {
        dispatch!(self.delete_context(context_id))
    }

    async fn search_contexts(&self, filters: &SearchFilters) -> Result<Vec<Context>> {
        dispatch!(self.search_contexts(filters))
    }

    async fn get_context_tags(&self, context_id: &str) -> Result<Vec<String>> {
        dispatch!(self.get_context_tags(context_id))
    }

    async fn add_context_tag(&self, context_id: &str, tag: &str) -> Result<bool> {
        dispatch!(self.add_context_tag(context_id, tag))
    }

    async fn get_popular_tags(
        &self,
        limit: usize,
        min_usage: u64,
        project_id: Option<&str>,
    ) -> Result<Vec<PopularTag>> {
        dispatch!(self.get_popular_tags(limit, min_usage, project_id))
    }

    async fn find_contexts_by_multiple_tags(
        &self,
        tags: &[String],
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Context>> {
        dispatch!(self.find_contexts_by_multiple_tags(tags, project_id, limit))
    }

    async fn list_all_projects_global(&self) -> Result<Vec<ProjectInfo>> {
        dispatch!(self.list_all_projects_global())
    }

    async fn get_storage_stats(&self) -> Result<StorageStats> {
        dispatch!(self.get_storage_stats())
    }

    async fn analyze_tag_patterns(&self, limit: usize) -> Result<Vec<TagPattern>> {
        dispatch!(self.analyze_tag_patterns(limit))
    }

    async fn count_contexts(&self, project_id: Option<&str>) -> Result<u64> {
        dispatch!(self.count_contexts(project_id))
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        dispatch!(self.cleanup_expired())
    }

    async fn cleanup_unused_tags(&self) -> Result<usize> {
        dispatch!(self.cleanup_unused_tags())
    }

    async fn close(&self) {
        dispatch!(self.close())
    }
}

/// Build and initialize the backend selected by the descriptor.
///
/// # Errors
///
/// Propagates every backend construction and initialization failure.
pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Backend> {
    let backend = match descriptor {
        ConnectionDescriptor::Sqlite(cfg) => Backend::Sqlite(SqliteStorage::open(cfg)?),
        ConnectionDescriptor::Redis(cfg) => Backend::Redis(
            RedisStorage::connect(cfg, config::redis_key_prefix(), config::redis_ttl_hours())
                .await?,
        ),
    };

    backend.initialize().await?;
    info!(provider = descriptor.provider(), "storage backend initialized");
    Ok(backend)
}
