//! Tool dispatch for the MCP surface.
//!
//! The protocol layer hands this module an operation name plus a flat
//! argument record; arguments are validated and normalized here, then
//! routed to the storage backend. Results and recoverable errors are
//! rendered as MCP text content blocks; configuration and permission
//! errors propagate to the protocol layer instead.

pub mod format;

use crate::error::{Error, Result};
use crate::project::normalize_project_id;
use crate::storage::{Backend, Storage};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Maximum number of entries accepted in `tags_filter`.
pub const MAX_TAGS_FILTER: usize = 10;

/// Default minimum importance for non-init loads.
const DEFAULT_IMPORTANCE_MIN: i64 = 7;

/// Default load limit.
const DEFAULT_LOAD_LIMIT: usize = 30;

/// Executes named memory operations against the configured backend.
pub struct ToolHandler {
    storage: Backend,
}

impl ToolHandler {
    #[must_use]
    pub fn new(storage: Backend) -> Self {
        Self { storage }
    }

    #[must_use]
    pub fn storage(&self) -> &Backend {
        &self.storage
    }

    /// Execute a tool by name.
    ///
    /// Storage and validation failures become error text blocks (the
    /// caller still gets a well-formed response); configuration and
    /// permission errors propagate.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tool names and for errors that must
    /// propagate per the severity policy.
    pub async fn dispatch(&self, name: &str, args: &Value) -> Result<Value> {
        let result = match name {
            "save_context" => self.save_context(args).await,
            "load_contexts" => self.load_contexts(args).await,
            "forget_context" => self.forget_context(args).await,
            "list_all_projects" => self.list_all_projects().await,
            "get_popular_tags" => self.get_popular_tags(args).await,
            other => Err(Error::Validation(format!("unknown tool: {other}"))),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.must_propagate() => Err(e),
            Err(e) => {
                warn!(tool = name, error = %e, code = e.error_code().as_str(), "tool execution failed");
                Ok(error_block(&e))
            }
        }
    }

    async fn save_context(&self, args: &Value) -> Result<Value> {
        let content = require_str(args, "content")?;
        let importance_level = require_i64(args, "importance_level")?;
        let tags = optional_string_list(args, "tags");
        // Saves always land in a concrete namespace: a missing project id
        // normalizes to the fallback token.
        let project_id = normalize_project_id(optional_str(args, "project_id").as_deref());

        let context_id = self
            .storage
            .save_context(content, importance_level, Some(&project_id), &tags)
            .await?;

        info!(%context_id, %project_id, importance_level, "context saved");
        Ok(text_block(format!(
            "Context saved successfully.\n\n\
             - Context ID: {context_id}\n\
             - Project: {project_id}\n\
             - Importance: {importance_level}/10\n\
             - Content: {}",
            truncate(content, 100)
        )))
    }

    async fn load_contexts(&self, args: &Value) -> Result<Value> {
        let project_arg = optional_str(args, "project_id");
        let project_id = normalize_project_id(project_arg.as_deref());
        let importance_min =
            optional_i64(args, "importance_level").unwrap_or(DEFAULT_IMPORTANCE_MIN);
        let limit = optional_usize(args, "limit").unwrap_or(DEFAULT_LOAD_LIMIT);

        let tags_filter = match args.get("tags_filter") {
            None | Some(Value::Null) => None,
            Some(Value::Array(raw)) => {
                let tags: Vec<String> = raw
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                if tags.len() > MAX_TAGS_FILTER {
                    return Err(Error::Validation(format!(
                        "maximum {MAX_TAGS_FILTER} tags allowed in tags_filter"
                    )));
                }
                (!tags.is_empty()).then_some(tags)
            }
            Some(_) => {
                return Err(Error::Validation(
                    "tags_filter must be a list of strings".into(),
                ))
            }
        };

        // A tag filter implies a targeted query, never an init load.
        let init_load = tags_filter.is_none() && optional_bool(args, "init_load").unwrap_or(true);

        let (contexts, instruction) = if init_load {
            let package = self
                .storage
                .load_init_contexts(Some(&project_id), limit)
                .await?;
            (package.contexts, Some(package.init_instruction))
        } else {
            let contexts = self
                .storage
                .load_contexts(
                    Some(&project_id),
                    limit,
                    importance_min,
                    tags_filter.as_deref(),
                )
                .await?;
            (contexts, None)
        };

        info!(
            %project_id,
            count = contexts.len(),
            init_load,
            "contexts loaded"
        );

        if contexts.is_empty() {
            return Ok(text_block(format!(
                "No saved contexts found for project '{project_id}'.\n\nMemory is currently empty."
            )));
        }

        let mut text = String::new();
        if let Some(instruction) = instruction.filter(|i| !i.is_empty()) {
            text.push_str(&format!("## Custom Instructions\n\n{instruction}\n\n"));
        }

        text.push_str("Memory loaded.\n\n");
        text.push_str(&format!(
            "Summary: {}\n\n",
            format::summarize(&contexts, Some(&project_id), limit)
        ));

        let popular = self
            .storage
            .get_popular_tags(10, 2, Some(&project_id))
            .await
            .unwrap_or_default();
        if !popular.is_empty() {
            text.push_str(&format!(
                "Popular tags: {}\n\n",
                format::render_popular_tags(&popular)
            ));
        }

        text.push_str(&format!(
            "Memory contexts in chronological order (showing last {} entries):\n\n",
            contexts.len().min(10)
        ));
        text.push_str(&format::render_context_listing(&contexts));

        Ok(text_block(text))
    }

    async fn forget_context(&self, args: &Value) -> Result<Value> {
        let context_id = require_id(args, "context_id")?;
        let removed = self.storage.forget_context(&context_id).await?;

        if removed {
            info!(%context_id, "context forgotten");
            Ok(text_block(format!(
                "Context deleted successfully.\n\n\
                 - Context ID: {context_id}\n\
                 - Status: permanently removed from memory"
            )))
        } else {
            Ok(text_block(format!(
                "Context not found.\n\n\
                 - Context ID: {context_id}\n\
                 - Status: not found or already deleted"
            )))
        }
    }

    async fn list_all_projects(&self) -> Result<Value> {
        let projects = self.storage.list_all_projects_global().await?;

        let mut text = String::from("All projects (ignores isolation)\n\n");
        if projects.is_empty() {
            text.push_str("No projects found in memory system.");
        } else {
            text.push_str(&format!("Found {} projects:\n", projects.len()));
            for project in &projects {
                text.push_str(&format!(
                    "- {} ({} contexts)\n",
                    project.id, project.context_count
                ));
            }
            text.push_str(
                "\nUse load_contexts(project_id=\"...\") to load a specific project's memory.",
            );
        }
        Ok(text_block(text))
    }

    async fn get_popular_tags(&self, args: &Value) -> Result<Value> {
        let limit = optional_usize(args, "limit").unwrap_or(20);
        let min_usage = optional_i64(args, "min_usage").unwrap_or(1).max(0) as u64;
        let project_id = optional_str(args, "project_id");
        let project_norm = project_id
            .as_deref()
            .map(|p| normalize_project_id(Some(p)));

        let tags = self
            .storage
            .get_popular_tags(limit, min_usage, project_norm.as_deref())
            .await?;

        let mut text = match &project_norm {
            Some(p) => format!("Popular tags for project '{p}'\n\n"),
            None => String::from("Popular tags across all projects\n\n"),
        };
        if tags.is_empty() {
            text.push_str("No tags meet the usage threshold yet.");
        } else {
            for tag in &tags {
                text.push_str(&format!("- {} ({} uses)\n", tag.tag, tag.count));
            }
        }
        Ok(text_block(text))
    }

}

/// Schemas for `tools/list`.
#[must_use]
pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "save_context",
            "description": "Save important information to persistent memory. \
                Use importance_level 1-10 to rate how worth surfacing this is later.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "Text to remember"},
                    "importance_level": {"type": "integer", "minimum": 1, "maximum": 10},
                    "project_id": {"type": "string", "description": "Project namespace (optional)"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["content", "importance_level"]
            }
        },
        {
            "name": "load_contexts",
            "description": "Load saved contexts. Call with init_load=true at session start \
                to get the prioritized slab plus operator instructions.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "importance_level": {"type": "integer", "minimum": 1, "maximum": 10},
                    "limit": {"type": "integer"},
                    "tags_filter": {
                        "type": "array",
                        "items": {"type": "string"},
                        "maxItems": MAX_TAGS_FILTER,
                        "description": "OR-filter by tags; forces init_load=false"
                    },
                    "init_load": {"type": "boolean"}
                }
            }
        },
        {
            "name": "forget_context",
            "description": "Permanently delete a context by id.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "context_id": {"type": "string"}
                },
                "required": ["context_id"]
            }
        },
        {
            "name": "list_all_projects",
            "description": "List every project namespace in the memory system.",
            "inputSchema": {"type": "object", "properties": {}}
        },
        {
            "name": "get_popular_tags",
            "description": "Show the most used tags, optionally scoped to a project.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "min_usage": {"type": "integer"},
                    "project_id": {"type": "string"}
                }
            }
        }
    ])
}

// ── Argument helpers ──────────────────────────────────────────

/// Truncate on a character boundary, appending an ellipsis when cut.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

fn text_block(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn error_block(error: &Error) -> Value {
    let code = error.error_code();
    text_block(format!(
        "Error: {error}\n\n- Code: {}\n- Retryable: {}",
        code.as_str(),
        code.is_retryable()
    ))
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation(format!("missing required argument: {key}")))
}

fn require_i64(args: &Value, key: &str) -> Result<i64> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Validation(format!("missing required argument: {key}")))
}

/// Ids may arrive as strings or numbers; both render to the opaque form.
fn require_id(args: &Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::Validation(format!(
            "missing required argument: {key}"
        ))),
    }
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn optional_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

fn optional_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
}

/// Booleans arrive as JSON bools or as agent-typed strings.
fn optional_bool(args: &Value, key: &str) -> Option<bool> {
    match args.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => {
            Some(!matches!(s.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
        }
        _ => None,
    }
}

/// String-array argument; non-strings and empties are dropped.
fn optional_string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|raw| {
            raw.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .filter(|t| !t.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn handler() -> ToolHandler {
        ToolHandler::new(Backend::Sqlite(SqliteStorage::open_memory().unwrap()))
    }

    fn text_of(value: &Value) -> &str {
        value["content"][0]["text"].as_str().unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let handler = handler();
        let saved = handler
            .dispatch(
                "save_context",
                &json!({
                    "content": "Hello",
                    "importance_level": 7,
                    "project_id": "demo",
                    "tags": ["a", "b"]
                }),
            )
            .await
            .unwrap();
        assert!(text_of(&saved).contains("Context saved successfully"));

        let loaded = handler
            .dispatch(
                "load_contexts",
                &json!({"project_id": "demo", "importance_level": 1, "init_load": false}),
            )
            .await
            .unwrap();
        let text = text_of(&loaded);
        assert!(text.contains("Hello"));
        assert!(text.contains("7/10"));
        assert!(text.contains("Tags: a, b"));
    }

    #[tokio::test]
    async fn missing_required_arg_is_an_error_block() {
        let handler = handler();
        let out = handler
            .dispatch("save_context", &json!({"content": "x"}))
            .await
            .unwrap();
        let text = text_of(&out);
        assert!(text.contains("importance_level"));
        assert!(text.contains("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn importance_out_of_range_is_an_error_block() {
        let handler = handler();
        let out = handler
            .dispatch(
                "save_context",
                &json!({"content": "x", "importance_level": 12}),
            )
            .await
            .unwrap();
        assert!(text_of(&out).contains("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn oversized_tags_filter_is_rejected() {
        let handler = handler();
        let tags: Vec<String> = (0..11).map(|i| format!("t{i}")).collect();
        let out = handler
            .dispatch("load_contexts", &json!({"tags_filter": tags}))
            .await
            .unwrap();
        assert!(text_of(&out).contains("maximum 10 tags"));
    }

    #[tokio::test]
    async fn tags_filter_forces_non_init_load() {
        let handler = handler();
        handler
            .dispatch(
                "save_context",
                &json!({"content": "tagged", "importance_level": 5, "project_id": "p", "tags": ["x"]}),
            )
            .await
            .unwrap();

        // init_load=true plus a tags_filter must behave as a plain
        // filtered load (no instruction header).
        let out = handler
            .dispatch(
                "load_contexts",
                &json!({
                    "project_id": "p",
                    "importance_level": 1,
                    "tags_filter": ["x"],
                    "init_load": true
                }),
            )
            .await
            .unwrap();
        let text = text_of(&out);
        assert!(text.contains("tagged"));
        assert!(!text.contains("## Custom Instructions"));
    }

    #[tokio::test]
    async fn forget_context_reports_both_outcomes() {
        let handler = handler();
        handler
            .dispatch(
                "save_context",
                &json!({"content": "x", "importance_level": 5, "project_id": "p"}),
            )
            .await
            .unwrap();

        let removed = handler
            .dispatch("forget_context", &json!({"context_id": "1"}))
            .await
            .unwrap();
        assert!(text_of(&removed).contains("deleted successfully"));

        let missing = handler
            .dispatch("forget_context", &json!({"context_id": "1"}))
            .await
            .unwrap();
        assert!(text_of(&missing).contains("not found"));
    }

    #[tokio::test]
    async fn project_listing_shows_counts() {
        let handler = handler();
        for project in ["alpha", "alpha", "beta"] {
            handler
                .dispatch(
                    "save_context",
                    &json!({"content": "c", "importance_level": 5, "project_id": project}),
                )
                .await
                .unwrap();
        }

        let out = handler.dispatch("list_all_projects", &json!({})).await.unwrap();
        let text = text_of(&out);
        assert!(text.contains("Found 2 projects"));
        assert!(text.contains("alpha (2 contexts)"));
        assert!(text.contains("beta (1 contexts)"));
    }

    #[tokio::test]
    async fn popular_tags_tool_lists_counts() {
        let handler = handler();
        for _ in 0..3 {
            handler
                .dispatch(
                    "save_context",
                    &json!({"content": "c", "importance_level": 5, "project_id": "bulk", "tags": ["common"]}),
                )
                .await
                .unwrap();
        }

        let out = handler
            .dispatch("get_popular_tags", &json!({"limit": 10, "min_usage": 2}))
            .await
            .unwrap();
        assert!(text_of(&out).contains("common (3 uses)"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_block() {
        let handler = handler();
        let out = handler.dispatch("no_such_tool", &json!({})).await.unwrap();
        assert!(text_of(&out).contains("unknown tool"));
    }

    #[tokio::test]
    async fn project_ids_collide_by_design() {
        let handler = handler();
        handler
            .dispatch(
                "save_context",
                &json!({"content": "one", "importance_level": 5, "project_id": "My_Project"}),
            )
            .await
            .unwrap();

        let out = handler
            .dispatch(
                "load_contexts",
                &json!({"project_id": "my-project", "importance_level": 1, "init_load": false}),
            )
            .await
            .unwrap();
        assert!(text_of(&out).contains("one"));
    }
}
