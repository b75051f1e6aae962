//! Project identifier normalization.
//!
//! Project ids partition contexts into tenant namespaces. Normalization is
//! lossy on purpose: `"My_Project"`, `"my-project"`, and `"  MY PROJECT  "`
//! all collapse to `"my project"` so that agents reconnecting with a
//! slightly different spelling still land in the same namespace. There is
//! no opt-out; downstream queries rely on `normalize(normalize(x)) ==
//! normalize(x)`.

/// Fallback namespace used when no project id is supplied.
pub const FALLBACK_PROJECT: &str = "general";

/// Normalize a possibly-missing project id.
///
/// `None`, empty, and all-whitespace inputs map to [`FALLBACK_PROJECT`].
/// Everything else is trimmed, lowercased, has `_` and `-` replaced with
/// spaces, and has whitespace runs collapsed to single spaces.
#[must_use]
pub fn normalize_project_id(project_id: Option<&str>) -> String {
    let Some(raw) = project_id else {
        return FALLBACK_PROJECT.to_string();
    };
    if raw.trim().is_empty() {
        return FALLBACK_PROJECT.to_string();
    }

    let lowered = raw.trim().to_lowercase();
    let spaced = lowered.replace(['_', '-'], " ");
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize an optional project filter, preserving "no filter".
///
/// Query paths use `None` to mean "all projects", so it must survive
/// normalization untouched; present values go through
/// [`normalize_project_id`] (including the whitespace-to-fallback rule).
#[must_use]
pub fn normalize_project_filter(project_id: Option<&str>) -> Option<String> {
    project_id.map(|p| normalize_project_id(Some(p)))
}

/// Check whether a project id is the fallback namespace.
#[must_use]
pub fn is_fallback_project(project_id: &str) -> bool {
    project_id == FALLBACK_PROJECT
}
