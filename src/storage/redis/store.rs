//! Redis storage backend.
//!
//! Contexts are JSON documents with their tags embedded in-document;
//! denormalized index lists make project- and tag-scoped queries cheap:
//!
//! | Key pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `<prefix>:context:<uuid>` | String | Context document (JSON) |
//! | `<prefix>:project:<id>:contexts` | List | Project index, newest at head |
//! | `<prefix>:tag:<name>:contexts` | List | Tag index |
//! | `<prefix>:projects` | Hash | Sentinel created at init |
//!
//! Every write refreshes the configured TTL. The backend holds a
//! [`MultiplexedConnection`], which clones cheaply; each method clones it
//! for concurrent safety.
//!
//! Batch discipline: multi-key reads go through pipelines and MGET. A
//! per-tag or per-context command loop is a bug here, not a style choice.

use crate::config::RedisConfig;
use crate::error::{Error, Result};
use crate::model::{
    normalize_tags, sort_newest_first, Context, ImportanceBucket, PopularTag, ProjectInfo,
    SearchFilters, StorageStats, TagPattern, STATUS_ACTIVE,
};
use crate::project::normalize_project_filter;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key construction for the configured namespace prefix.
#[derive(Debug, Clone)]
struct KeySchema {
    prefix: String,
}

impl KeySchema {
    fn context(&self, id: &str) -> String {
        format!("{}:context:{id}", self.prefix)
    }

    fn context_pattern(&self) -> String {
        format!("{}:context:*", self.prefix)
    }

    fn project_contexts(&self, project_id: &str) -> String {
        format!("{}:project:{project_id}:contexts", self.prefix)
    }

    fn project_pattern(&self) -> String {
        format!("{}:project:*:contexts", self.prefix)
    }

    fn tag_contexts(&self, tag: &str) -> String {
        format!("{}:tag:{tag}:contexts", self.prefix)
    }

    fn tag_pattern(&self) -> String {
        format!("{}:tag:*:contexts", self.prefix)
    }

    fn projects(&self) -> String {
        format!("{}:projects", self.prefix)
    }

    /// Extract the document id from a context key. Stripping the known
    /// prefix keeps ids containing colons intact.
    fn id_from_context_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:context:", self.prefix))
    }

    /// Extract the tag name from a `<prefix>:tag:<name>:contexts` key.
    fn tag_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:tag:", self.prefix))?
            .strip_suffix(":contexts")
    }

    /// Extract the project id from a `<prefix>:project:<id>:contexts` key.
    fn project_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:project:", self.prefix))?
            .strip_suffix(":contexts")
    }
}

/// Redis-based storage backend.
#[derive(Debug, Clone)]
pub struct RedisStorage {
    conn: MultiplexedConnection,
    keys: KeySchema,
    ttl_seconds: Option<i64>,
    endpoint: String,
}

fn validate_importance(importance_level: i64) -> Result<()> {
    if (1..=10).contains(&importance_level) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "importance_level must be between 1 and 10, got {importance_level}"
    )))
}

impl RedisStorage {
    /// Connect to Redis and build the backend.
    ///
    /// Fails fast: a backend that cannot reach its server must abort
    /// startup instead of letting the host fall back to another store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the connection cannot be
    /// established.
    pub async fn connect(
        config: &RedisConfig,
        key_prefix: String,
        ttl_hours: u64,
    ) -> Result<Self> {
        let client = redis::Client::open(config.url()).map_err(|e| {
            Error::Config(format!(
                "failed to create Redis client for {}: {e}",
                config.endpoint()
            ))
        })?;

        let conn = client
            .get_multiplexed_async_connection_with_timeouts(
                Duration::from_secs_f64(config.socket_timeout),
                Duration::from_secs_f64(config.socket_connect_timeout),
            )
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "failed to connect to Redis at {}: {e}. \
                     Please ensure the Redis server is running and accessible.",
                    config.endpoint()
                ))
            })?;

        info!(endpoint = %config.endpoint(), prefix = %key_prefix, ttl_hours, "redis storage connected");
        Ok(Self {
            conn,
            keys: KeySchema { prefix: key_prefix },
            ttl_seconds: (ttl_hours > 0).then(|| (ttl_hours * 3600) as i64),
            endpoint: config.endpoint(),
        })
    }

    /// Load documents for a batch of ids with a single MGET.
    async fn mget_contexts(&self, ids: &[String]) -> Result<Vec<Context>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.keys.context(id)).collect();
        let mut conn = self.conn.clone();
        let payloads: Vec<Option<String>> = conn.mget(&keys).await?;

        let mut contexts = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.into_iter().enumerate() {
            let Some(json) = payload else { continue };
            match serde_json::from_str::<Context>(&json) {
                Ok(context) => contexts.push(context),
                Err(e) => warn!(context_id = %ids[i], error = %e, "skipping undecodable context document"),
            }
        }
        Ok(contexts)
    }

    /// All context ids currently stored, via SCAN over document keys.
    async fn scan_context_ids(&self) -> Result<Vec<String>> {
        let pattern = self.keys.context_pattern();
        let mut conn = self.conn.clone();
        let mut ids = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                if let Some(id) = self.keys.id_from_context_key(&key) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Candidate ids for a multi-tag OR query.
    ///
    /// One pipelined LRANGE round-trip over all tag lists, then (for
    /// project-scoped queries) one MGET to check document ownership.
    async fn find_context_ids_by_tags(
        &self,
        tag_names: &[String],
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let normalized = normalize_tags(tag_names);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for tag in &normalized {
            pipe.lrange(self.keys.tag_contexts(tag), 0, -1);
        }
        let lists: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        // Union with first-seen order preserved (OR semantics).
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for list in lists {
            for id in list {
                if seen.insert(id.clone()) {
                    candidates.push(id);
                }
            }
        }

        let Some(project) = project_id else {
            candidates.truncate(limit);
            return Ok(candidates);
        };

        // Project scoping needs the documents; batch-load and keep owners.
        let contexts = self.mget_contexts(&candidates).await?;
        let owners: HashMap<&str, Option<&str>> = contexts
            .iter()
            .map(|c| (c.id.as_str(), c.project_id.as_deref()))
            .collect();
        let filtered: Vec<String> = candidates
            .into_iter()
            .filter(|id| owners.get(id.as_str()) == Some(&Some(project)))
            .take(limit)
            .collect();
        Ok(filtered)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn initialize(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            Error::Config(format!(
                "Redis initialization failed for {}: {e}",
                self.endpoint
            ))
        })?;

        // Seed the projects hash so the key exists.
        let _: bool = conn
            .hset_nx(self.keys.projects(), "initialized", "true")
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn save_context(
        &self,
        content: &str,
        importance_level: i64,
        project_id: Option<&str>,
        tag_names: &[String],
    ) -> Result<String> {
        validate_importance(importance_level)?;
        let project = normalize_project_filter(project_id);
        let tag_list = normalize_tags(tag_names);

        let context = Context {
            id: Uuid::new_v4().to_string(),
            project_id: project.clone(),
            content: content.to_string(),
            importance_level,
            status: STATUS_ACTIVE.to_string(),
            tags: tag_list.clone(),
            created_at: Utc::now(),
            expires_at: None,
        };
        let payload = serde_json::to_string(&context)?;

        // Document plus all index updates in one pipelined round-trip;
        // readers may briefly observe the document before the indexes.
        let mut pipe = redis::pipe();
        let context_key = self.keys.context(&context.id);
        match self.ttl_seconds {
            Some(ttl) => {
                pipe.set_ex(&context_key, &payload, ttl as u64).ignore();
            }
            None => {
                pipe.set(&context_key, &payload).ignore();
            }
        }
        if let Some(ref p) = project {
            let project_key = self.keys.project_contexts(p);
            pipe.lpush(&project_key, &context.id).ignore();
            if let Some(ttl) = self.ttl_seconds {
                pipe.expire(&project_key, ttl).ignore();
            }
        }
        for tag in &tag_list {
            let tag_key = self.keys.tag_contexts(tag);
            pipe.lpush(&tag_key, &context.id).ignore();
            if let Some(ttl) = self.ttl_seconds {
                pipe.expire(&tag_key, ttl).ignore();
            }
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(context_id = %context.id, project = project.as_deref(), "context saved");
        Ok(context.id)
    }

    async fn load_context(&self, context_id: &str) -> Result<Option<Context>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(self.keys.context(context_id)).await?;
        let Some(json) = payload else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn load_contexts(
        &self,
        project_id: Option<&str>,
        limit: usize,
        importance_threshold: i64,
        tags_filter: Option<&[String]>,
    ) -> Result<Vec<Context>> {
        let project = normalize_project_filter(project_id);

        let filter = tags_filter.map(normalize_tags).unwrap_or_default();
        let ids = if filter.is_empty() {
            if let Some(ref p) = project {
                let mut conn = self.conn.clone();
                conn.lrange(
                    self.keys.project_contexts(p),
                    0,
                    limit.saturating_sub(1) as isize,
                )
                .await?
            } else {
                self.scan_context_ids().await?
            }
        } else {
            self.find_context_ids_by_tags(&filter, project.as_deref(), limit)
                .await?
        };

        let mut contexts = self.mget_contexts(&ids).await?;
        contexts.retain(|c| c.importance_level >= importance_threshold);
        sort_newest_first(&mut contexts);
        contexts.truncate(limit);
        Ok(contexts)
    }

    async fn load_contexts_by_ids(&self, context_ids: &[String]) -> Result<Vec<Context>> {
        let mut contexts = self.mget_contexts(context_ids).await?;
        sort_newest_first(&mut contexts);
        Ok(contexts)
    }

    async fn update_context(
        &self,
        context_id: &str,
        content: Option<&str>,
        importance_level: Option<i64>,
    ) -> Result<bool> {
        if let Some(level) = importance_level {
            validate_importance(level)?;
        }

        let mut conn = self.conn.clone();
        let context_key = self.keys.context(context_id);
        let payload: Option<String> = conn.get(&context_key).await?;
        let Some(json) = payload else {
            return Ok(false);
        };

        let mut context: Context = serde_json::from_str(&json)?;
        if let Some(text) = content {
            context.content = text.to_string();
        }
        if let Some(level) = importance_level {
            context.importance_level = level;
        }

        let updated = serde_json::to_string(&context)?;
        match self.ttl_seconds {
            Some(ttl) => {
                let _: () = conn.set_ex(&context_key, updated, ttl as u64).await?;
            }
            None => {
                let _: () = conn.set(&context_key, updated).await?;
            }
        }
        Ok(true)
    }

    async fn delete_context(&self, context_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let context_key = self.keys.context(context_id);
        let payload: Option<String> = conn.get(&context_key).await?;
        let Some(json) = payload else {
            return Ok(false);
        };
        let context: Context = serde_json::from_str(&json)?;

        let deleted: i64 = conn.del(&context_key).await?;

        // Best-effort index cascade: a failed LREM leaves a stale id that
        // later loads skip, so log and continue.
        if let Some(ref project) = context.project_id {
            let key = self.keys.project_contexts(project);
            let removed: redis::RedisResult<i64> = conn.lrem(&key, 1, context_id).await;
            if let Err(e) = removed {
                warn!(%key, error = %e, "failed to remove context from project index");
            }
        }
        for tag in &context.tags {
            let key = self.keys.tag_contexts(tag);
            let removed: redis::RedisResult<i64> = conn.lrem(&key, 1, context_id).await;
            if let Err(e) = removed {
                warn!(%key, error = %e, "failed to remove context from tag index");
            }
        }

        debug!(context_id, "context deleted");
        Ok(deleted > 0)
    }

    async fn search_contexts(&self, filters: &SearchFilters) -> Result<Vec<Context>> {
        let project = normalize_project_filter(filters.project_id.as_deref());

        let tag_filter = normalize_tags(&filters.tags);
        let ids = if tag_filter.is_empty() {
            self.scan_context_ids().await?
        } else {
            self.find_context_ids_by_tags(
                &tag_filter,
                project.as_deref(),
                filters.limit.saturating_mul(2),
            )
            .await?
        };

        let mut contexts = self.mget_contexts(&ids).await?;
        if tag_filter.is_empty() {
            if let Some(ref p) = project {
                contexts.retain(|c| c.project_id.as_deref() == Some(p));
            }
        }
        contexts.retain(|c| c.importance_level >= filters.min_importance);
        if let Some(ref needle) = filters.content_search {
            let needle = needle.to_lowercase();
            contexts.retain(|c| c.content.to_lowercase().contains(&needle));
        }
        sort_newest_first(&mut contexts);
        contexts.truncate(filters.limit);
        Ok(contexts)
    }

    async fn get_context_tags(&self, context_id: &str) -> Result<Vec<String>> {
        Ok(self
            .load_context(context_id)
            .await?
            .map(|c| c.tags)
            .unwrap_or_default())
    }

    async fn add_context_tag(&self, context_id: &str, tag: &str) -> Result<bool> {
        let normalized = crate::model::normalize_tag(tag);
        if normalized.is_empty() {
            return Err(Error::Validation("tag cannot be empty".into()));
        }

        let mut conn = self.conn.clone();
        let context_key = self.keys.context(context_id);
        let payload: Option<String> = conn.get(&context_key).await?;
        let Some(json) = payload else {
            return Ok(false);
        };

        let mut context: Context = serde_json::from_str(&json)?;
        if !context.tags.contains(&normalized) {
            context.tags.push(normalized.clone());
            let updated = serde_json::to_string(&context)?;

            let mut pipe = redis::pipe();
            match self.ttl_seconds {
                Some(ttl) => {
                    pipe.set_ex(&context_key, &updated, ttl as u64).ignore();
                }
                None => {
                    pipe.set(&context_key, &updated).ignore();
                }
            }
            let tag_key = self.keys.tag_contexts(&normalized);
            pipe.lpush(&tag_key, context_id).ignore();
            if let Some(ttl) = self.ttl_seconds {
                pipe.expire(&tag_key, ttl).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(true)
    }

    async fn get_popular_tags(
        &self,
        limit: usize,
        min_usage: u64,
        project_id: Option<&str>,
    ) -> Result<Vec<PopularTag>> {
        let project = normalize_project_filter(project_id);
        let mut conn = self.conn.clone();

        let tag_keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.keys.tag_pattern())
            .query_async(&mut conn)
            .await?;
        if tag_keys.is_empty() {
            return Ok(Vec::new());
        }

        // One pipelined round-trip for every tag list.
        let mut pipe = redis::pipe();
        for key in &tag_keys {
            pipe.lrange(key, 0, -1);
        }
        let lists: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        let mut counts: Vec<(String, u64)> = Vec::new();
        if let Some(ref p) = project {
            // Ownership check needs the documents; batch them with MGET.
            let mut all_ids: Vec<String> = Vec::new();
            let mut seen = HashSet::new();
            for list in &lists {
                for id in list {
                    if seen.insert(id.clone()) {
                        all_ids.push(id.clone());
                    }
                }
            }
            let contexts = self.mget_contexts(&all_ids).await?;
            let owners: HashMap<&str, Option<&str>> = contexts
                .iter()
                .map(|c| (c.id.as_str(), c.project_id.as_deref()))
                .collect();

            for (key, list) in tag_keys.iter().zip(&lists) {
                let Some(tag) = self.keys.tag_from_key(key) else {
                    continue;
                };
                let count = list
                    .iter()
                    .filter(|id| owners.get(id.as_str()) == Some(&Some(p.as_str())))
                    .count() as u64;
                if count >= min_usage {
                    counts.push((tag.to_string(), count));
                }
            }
        } else {
            for (key, list) in tag_keys.iter().zip(&lists) {
                let Some(tag) = self.keys.tag_from_key(key) else {
                    continue;
                };
                let count = list.len() as u64;
                if count >= min_usage {
                    counts.push((tag.to_string(), count));
                }
            }
        }

        // Usage desc, then name asc for deterministic output.
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        Ok(counts
            .into_iter()
            .map(|(tag, count)| PopularTag { tag, count })
            .collect())
    }

    async fn find_contexts_by_multiple_tags(
        &self,
        tag_names: &[String],
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Context>> {
        let project = normalize_project_filter(project_id);
        let ids = self
            .find_context_ids_by_tags(tag_names, project.as_deref(), limit)
            .await?;
        self.load_contexts_by_ids(&ids).await
    }

    async fn list_all_projects_global(&self) -> Result<Vec<ProjectInfo>> {
        let mut conn = self.conn.clone();
        let project_keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.keys.project_pattern())
            .query_async(&mut conn)
            .await?;
        if project_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &project_keys {
            pipe.llen(key);
        }
        let lengths: Vec<i64> = pipe.query_async(&mut conn).await?;

        let mut projects: Vec<ProjectInfo> = project_keys
            .iter()
            .zip(lengths)
            .filter_map(|(key, len)| {
                let id = self.keys.project_from_key(key)?;
                Some(ProjectInfo {
                    id: id.to_string(),
                    name: id.to_string(),
                    context_count: len.max(0) as u64,
                })
            })
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn get_storage_stats(&self) -> Result<StorageStats> {
        let ids = self.scan_context_ids().await?;
        let contexts = self.mget_contexts(&ids).await?;

        let active: Vec<&Context> = contexts
            .iter()
            .filter(|c| c.status == STATUS_ACTIVE)
            .collect();
        let projects: HashSet<&str> = active
            .iter()
            .filter_map(|c| c.project_id.as_deref())
            .collect();

        let mut histogram: HashMap<i64, u64> = HashMap::new();
        for context in &active {
            *histogram.entry(context.importance_level).or_default() += 1;
        }
        let mut importance_levels: Vec<ImportanceBucket> = histogram
            .into_iter()
            .map(|(level, count)| ImportanceBucket { level, count })
            .collect();
        importance_levels.sort_by(|a, b| b.level.cmp(&a.level));

        let mut conn = self.conn.clone();
        let tag_keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.keys.tag_pattern())
            .query_async(&mut conn)
            .await?;

        let info: redis::InfoDict = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;
        let used_memory: i64 = info.get("used_memory").unwrap_or(0);

        Ok(StorageStats {
            provider: "redis".to_string(),
            active_contexts: active.len() as u64,
            active_projects: projects.len() as u64,
            total_tags: tag_keys.len() as u64,
            size_bytes: used_memory.max(0) as u64,
            oldest_context: active.iter().map(|c| c.created_at).min(),
            newest_context: active.iter().map(|c| c.created_at).max(),
            importance_levels,
        })
    }

    async fn analyze_tag_patterns(&self, limit: usize) -> Result<Vec<TagPattern>> {
        let ids = self.scan_context_ids().await?;
        let contexts = self.mget_contexts(&ids).await?;

        struct Acc {
            usage: u64,
            importance_sum: i64,
            latest: Option<chrono::DateTime<Utc>>,
            projects: HashSet<String>,
        }
        let mut by_tag: HashMap<String, Acc> = HashMap::new();
        for context in contexts.iter().filter(|c| c.status == STATUS_ACTIVE) {
            for tag in &context.tags {
                let acc = by_tag.entry(tag.clone()).or_insert_with(|| Acc {
                    usage: 0,
                    importance_sum: 0,
                    latest: None,
                    projects: HashSet::new(),
                });
                acc.usage += 1;
                acc.importance_sum += context.importance_level;
                acc.latest = Some(acc.latest.map_or(context.created_at, |existing| {
                    existing.max(context.created_at)
                }));
                if let Some(ref p) = context.project_id {
                    acc.projects.insert(p.clone());
                }
            }
        }

        let mut patterns: Vec<TagPattern> = by_tag
            .into_iter()
            .map(|(tag, acc)| TagPattern {
                tag,
                usage_count: acc.usage,
                avg_importance: acc.importance_sum as f64 / acc.usage as f64,
                latest_usage: acc.latest,
                project_count: acc.projects.len() as u64,
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| b.latest_usage.cmp(&a.latest_usage))
        });
        patterns.truncate(limit);
        Ok(patterns)
    }

    async fn count_contexts(&self, project_id: Option<&str>) -> Result<u64> {
        let project = normalize_project_filter(project_id);
        if let Some(ref p) = project {
            let mut conn = self.conn.clone();
            let len: i64 = conn.llen(self.keys.project_contexts(p)).await?;
            return Ok(len.max(0) as u64);
        }
        Ok(self.scan_context_ids().await?.len() as u64)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        // EXPIRE handles document expiry server-side; stale index entries
        // are skipped during loads.
        Ok(0)
    }

    async fn cleanup_unused_tags(&self) -> Result<usize> {
        // Redis removes a list key when its last element is LREM'd, so the
        // tag namespace has no orphaned dictionary to sweep.
        Ok(0)
    }

    async fn close(&self) {
        // Multiplexed connections close when the last clone drops.
        debug!(endpoint = %self.endpoint, "redis storage closing");
    }
}
