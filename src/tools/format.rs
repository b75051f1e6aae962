//! Human-readable summaries for tool responses.
//!
//! The wire protocol returns text content blocks; this module renders
//! loaded contexts into the headline + chronological listing the agent
//! sees.

use crate::model::{Context, PopularTag};
use chrono::{Duration, Utc};

/// Importance at or above which a context counts as "high" in summaries.
const HIGH_IMPORTANCE_THRESHOLD: i64 = 8;

/// Window for the "from last Nh" summary statistic.
const RECENT_HOURS: i64 = 24;

/// Maximum number of contexts rendered in full.
const MAX_LISTED: usize = 10;

/// One-line summary of a loaded context batch.
///
/// Distinguishes "Found" (everything there was) from "Loaded only"
/// (the limit was hit, more may exist).
#[must_use]
pub fn summarize(contexts: &[Context], project_id: Option<&str>, limit: usize) -> String {
    if contexts.is_empty() {
        return format!(
            "No saved context found for project {}.",
            project_id.unwrap_or("global")
        );
    }

    let recent_cutoff = Utc::now() - Duration::hours(RECENT_HOURS);
    let high = contexts
        .iter()
        .filter(|c| c.importance_level >= HIGH_IMPORTANCE_THRESHOLD)
        .count();
    let recent = contexts
        .iter()
        .filter(|c| c.created_at > recent_cutoff)
        .count();

    let verb = if limit > 0 && contexts.len() == limit {
        "Loaded only"
    } else {
        "Found"
    };

    let mut parts = vec![format!("{verb} {} saved contexts", contexts.len())];
    if let Some(project) = project_id {
        parts.push(format!("for project '{project}'"));
    }

    let mut details = Vec::new();
    if recent > 0 {
        details.push(format!("{recent} from last {RECENT_HOURS}h"));
    }
    if high > 0 {
        details.push(format!("{high} high-importance"));
    }
    if !details.is_empty() {
        parts.push(format!("including {}", details.join(", ")));
    }

    format!("{}.", parts.join(" "))
}

/// Render a context batch as chronological text (oldest first, like a
/// chat log), capped at [`MAX_LISTED`] entries.
#[must_use]
pub fn render_context_listing(contexts: &[Context]) -> String {
    let mut chronological: Vec<&Context> = contexts.iter().take(MAX_LISTED).collect();
    chronological.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut out = String::new();
    for context in &chronological {
        let stamp = context.created_at.format("%m-%d %H:%M");
        out.push_str(&format!(
            "(ID: {}, Importance: {}/10, {stamp})\n",
            context.id, context.importance_level
        ));
        if !context.tags.is_empty() {
            out.push_str(&format!("Tags: {}\n", context.tags.join(", ")));
        }
        out.push_str(&context.content);
        out.push_str("\n\n");
    }

    if contexts.len() > MAX_LISTED {
        out.push_str(&format!(
            "... and {} more contexts\n",
            contexts.len() - MAX_LISTED
        ));
    }
    out
}

/// Render popular tags for the response footer.
#[must_use]
pub fn render_popular_tags(tags: &[PopularTag]) -> String {
    tags.iter()
        .map(|t| format!("{} ({} uses)", t.tag, t.count))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::STATUS_ACTIVE;

    fn ctx(id: &str, importance: i64, age_hours: i64) -> Context {
        Context {
            id: id.to_string(),
            project_id: None,
            content: format!("content of {id}"),
            importance_level: importance,
            status: STATUS_ACTIVE.into(),
            tags: Vec::new(),
            created_at: Utc::now() - Duration::hours(age_hours),
            expires_at: None,
        }
    }

    #[test]
    fn empty_batch_summary() {
        let summary = summarize(&[], Some("demo"), 10);
        assert!(summary.contains("No saved context"));
        assert!(summary.contains("demo"));
    }

    #[test]
    fn summary_counts_high_and_recent() {
        let contexts = vec![ctx("1", 9, 1), ctx("2", 5, 1), ctx("3", 8, 100)];
        let summary = summarize(&contexts, Some("p"), 10);
        assert!(summary.starts_with("Found 3 saved contexts"));
        assert!(summary.contains("2 from last 24h"));
        assert!(summary.contains("2 high-importance"));
    }

    #[test]
    fn hitting_the_limit_changes_the_verb() {
        let contexts = vec![ctx("1", 5, 1), ctx("2", 5, 1)];
        let summary = summarize(&contexts, None, 2);
        assert!(summary.starts_with("Loaded only"));
    }

    #[test]
    fn listing_is_chronological_and_capped() {
        let contexts: Vec<Context> = (0..15).map(|i| ctx(&i.to_string(), 5, i)).collect();
        let listing = render_context_listing(&contexts);
        assert!(listing.contains("... and 5 more contexts"));
        // Oldest of the listed window comes first.
        let first = listing.find("(ID: 9,").unwrap();
        let last = listing.find("(ID: 0,").unwrap();
        assert!(first < last);
    }

    #[test]
    fn popular_tags_render_with_counts() {
        let tags = vec![
            PopularTag {
                tag: "rust".into(),
                count: 5,
            },
            PopularTag {
                tag: "db".into(),
                count: 2,
            },
        ];
        assert_eq!(render_popular_tags(&tags), "rust (5 uses), db (2 uses)");
    }
}
