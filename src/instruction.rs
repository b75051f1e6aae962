//! Operator instruction loading for session initialization.
//!
//! Operators can point `CUSTOM_INSTRUCTION_PATH` at a markdown or text
//! file whose contents are attached to every init load. The path is
//! validated before any read: symlinks are resolved, the extension must
//! be in the allowlist, and system directories plus credential stores are
//! blocked outright.

use crate::config;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Minimal instruction used when the configured one cannot be loaded.
pub const FALLBACK_INSTRUCTION: &str = "# Memory System Active\n\n\
    Use `load_contexts` with specific parameters:\n\
    - `importance_level` for priority filtering\n\
    - `tags_filter` for targeted queries\n\
    - `init_load=false` for subsequent calls";

/// Extensions an instruction file may carry.
const ALLOWED_EXTENSIONS: &[&str] = &["md", "txt", "text", "markdown"];

/// Absolute path prefixes that must never be read.
const BLOCKED_PREFIXES: &[&str] = &[
    "/etc/", "/proc/", "/sys/", "/dev/", "/bin/", "/sbin/", "/usr/bin/", "/usr/sbin/",
];

/// Home-relative directories that must never be read.
const BLOCKED_HOME_DIRS: &[&str] = &[".ssh", ".aws"];

/// Load the operator instruction configured via `CUSTOM_INSTRUCTION_PATH`.
///
/// Returns an empty string when the variable is unset or blank.
///
/// # Errors
///
/// Propagates permission errors for blocked paths and I/O errors for
/// unreadable files.
pub async fn load_custom_instruction() -> Result<String> {
    let Some(raw_path) = std::env::var(config::CUSTOM_INSTRUCTION_PATH)
        .ok()
        .filter(|p| !p.trim().is_empty())
    else {
        debug!("no custom instruction path configured");
        return Ok(String::new());
    };

    load_instruction_from_path(raw_path.trim()).await
}

/// Load an instruction file after validating the path.
///
/// # Errors
///
/// Returns a permission error for blocked or disallowed paths (without
/// reading them) and an I/O error when the file cannot be read.
pub async fn load_instruction_from_path(raw_path: &str) -> Result<String> {
    let path = validate_instruction_path(raw_path)?;

    let content = tokio::fs::read_to_string(&path).await?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "custom instruction file is empty");
        return Ok(String::new());
    }

    info!(path = %path.display(), bytes = trimmed.len(), "custom instruction loaded");
    Ok(trimmed.to_string())
}

/// Validate an instruction path: expand `~`, resolve symlinks, then check
/// the blocked-prefix list and the extension allowlist.
///
/// # Errors
///
/// Returns [`Error::Permission`] when the resolved path is blocked or
/// carries a disallowed extension. Validation never reads file contents.
pub fn validate_instruction_path(raw_path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(raw_path).into_owned();
    let expanded = PathBuf::from(expanded);

    // Resolve symlinks before the checks so a link into /etc cannot
    // bypass them. A missing file resolves to itself and fails later at
    // read time.
    let resolved = std::fs::canonicalize(&expanded).unwrap_or_else(|_| expanded.clone());

    if is_blocked_path(&resolved) {
        warn!(path = %resolved.display(), "blocked instruction path");
        return Err(Error::Permission { path: resolved });
    }

    let extension_ok = resolved
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ALLOWED_EXTENSIONS.contains(&e.to_lowercase().as_str()));
    if !extension_ok {
        warn!(path = %resolved.display(), "instruction file extension not allowed");
        return Err(Error::Permission { path: resolved });
    }

    Ok(resolved)
}

fn is_blocked_path(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    if BLOCKED_PREFIXES.iter().any(|p| path_str.starts_with(p)) {
        return true;
    }

    if let Some(base) = directories::BaseDirs::new() {
        for dir in BLOCKED_HOME_DIRS {
            if path.starts_with(base.home_dir().join(dir)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_markdown_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.md");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"# Hi\n\nremember things\n")
            .unwrap();

        let content = load_instruction_from_path(path.to_str().unwrap())
            .await
            .unwrap();
        assert!(content.contains("# Hi"));
    }

    #[tokio::test]
    async fn refuses_etc_passwd_without_reading() {
        let err = load_instruction_from_path("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[test]
    fn blocks_system_prefixes() {
        for path in [
            "/etc/hosts.md",
            "/proc/self/status.md",
            "/sys/kernel.md",
            "/usr/bin/thing.md",
        ] {
            assert!(
                matches!(validate_instruction_path(path), Err(Error::Permission { .. })),
                "{path} should be blocked"
            );
        }
    }

    #[test]
    fn blocks_credential_directories() {
        let err = validate_instruction_path("~/.ssh/id_rsa.md").unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
        let err = validate_instruction_path("~/.aws/credentials.md").unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[test]
    fn rejects_disallowed_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        let err = validate_instruction_path(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
    }

    #[test]
    fn symlink_into_blocked_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("innocent.md");
        // Target must exist for canonicalize to resolve the link.
        if std::os::unix::fs::symlink("/etc/hostname", &link).is_ok() {
            let err = validate_instruction_path(link.to_str().unwrap()).unwrap_err();
            assert!(matches!(err, Error::Permission { .. }));
        }
    }

    #[tokio::test]
    async fn empty_file_yields_empty_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.md");
        std::fs::write(&path, "   \n").unwrap();

        let content = load_instruction_from_path(path.to_str().unwrap())
            .await
            .unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = load_instruction_from_path("/tmp/definitely-not-here-mv.md")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
