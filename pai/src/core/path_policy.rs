//! Lexical half of the path-security policy.
//!
//! Resolves a raw path against the workspace root without touching the
//! filesystem: `.`/`..` collapse, root containment, and deny-list checks on
//! every component below the root. Symlink resolution lives in
//! [`crate::io::gateway`].

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::error::AgentError;

/// Component names that are never accessible, matched exactly and
/// case-sensitively.
pub const DEFAULT_DENY_LIST: [&str; 7] = [
    ".env",
    ".git",
    "venv",
    "__pycache__",
    ".pai_history",
    ".idea",
    ".vscode",
];

#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
    deny: BTreeSet<String>,
}

impl PathPolicy {
    /// `root` must be absolute; it is normalized lexically.
    pub fn new(root: &Path) -> Self {
        Self::with_deny_list(root, DEFAULT_DENY_LIST.iter().map(|s| s.to_string()))
    }

    pub fn with_deny_list(root: &Path, deny: impl IntoIterator<Item = String>) -> Self {
        let root = normalize_lexical(root).unwrap_or_else(|| root.to_path_buf());
        Self {
            root,
            deny: deny.into_iter().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_denied_name(&self, name: &str) -> bool {
        self.deny.contains(name)
    }

    /// Resolve `raw` to an absolute path under the root, or fail.
    pub fn check_lexical(&self, raw: &str) -> Result<PathBuf, AgentError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AgentError::path_security(raw, "path is empty"));
        }
        if trimmed.contains('\0') {
            return Err(AgentError::path_security(raw, "path contains NUL byte"));
        }

        let candidate = separators_to_native(trimmed);
        let joined = if candidate.is_absolute() {
            candidate
        } else {
            self.root.join(candidate)
        };

        let resolved = normalize_lexical(&joined)
            .ok_or_else(|| AgentError::path_security(raw, "path escapes the filesystem root"))?;
        let relative = resolved
            .strip_prefix(&self.root)
            .map_err(|_| AgentError::path_security(raw, "path is outside the workspace root"))?;

        self.check_components(raw, relative)?;
        Ok(resolved)
    }

    /// Deny-list check over every component of a root-relative path.
    pub fn check_components(&self, raw: &str, relative: &Path) -> Result<(), AgentError> {
        for component in relative.components() {
            if let Component::Normal(name) = component
                && let Some(name) = name.to_str()
                && self.is_denied_name(name)
            {
                return Err(AgentError::path_security(
                    raw,
                    format!("component '{name}' is deny-listed"),
                ));
            }
        }
        Ok(())
    }
}

/// Collapse `.` and `..` without consulting the filesystem.
///
/// Returns `None` when `..` would climb above the filesystem root.
pub fn normalize_lexical(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            }
        }
    }
    Some(out)
}

#[cfg(windows)]
fn separators_to_native(raw: &str) -> PathBuf {
    PathBuf::from(raw)
}

#[cfg(not(windows))]
fn separators_to_native(raw: &str) -> PathBuf {
    PathBuf::from(raw.replace('\\', "/"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn policy() -> PathPolicy {
        PathPolicy::new(Path::new("/work/project"))
    }

    fn is_violation(result: Result<PathBuf, AgentError>) -> bool {
        matches!(result, Err(AgentError::PathSecurity { .. }))
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let resolved = policy().check_lexical("src/./lib/../main.py").expect("valid");
        assert_eq!(resolved, PathBuf::from("/work/project/src/main.py"));
    }

    #[test]
    fn root_itself_is_allowed() {
        assert_eq!(
            policy().check_lexical(".").expect("valid"),
            PathBuf::from("/work/project")
        );
    }

    #[test]
    fn parent_traversal_above_root_fails() {
        assert!(is_violation(policy().check_lexical("../../etc/passwd")));
        assert!(is_violation(policy().check_lexical("src/../../sibling")));
    }

    #[test]
    fn absolute_paths_outside_root_fail() {
        assert!(is_violation(policy().check_lexical("/etc/passwd")));
        assert!(is_violation(policy().check_lexical("/work/project-other/x")));
    }

    #[test]
    fn absolute_paths_inside_root_pass() {
        let resolved = policy()
            .check_lexical("/work/project/src/app.py")
            .expect("valid");
        assert_eq!(resolved, PathBuf::from("/work/project/src/app.py"));
    }

    #[test]
    fn deny_list_applies_at_every_depth_and_form() {
        let policy = policy();
        for raw in [
            ".env",
            "./.env",
            "a/b/.git/config",
            "deep/er/__pycache__",
            "/work/project/.pai_history/session.jsonl",
            "x/venv/bin/python",
            "a\\.vscode\\settings.json",
            "src/../.idea",
        ] {
            assert!(is_violation(policy.check_lexical(raw)), "expected deny for {raw}");
        }
    }

    #[test]
    fn deny_list_is_literal_and_case_sensitive() {
        let policy = policy();
        for raw in [".env.example", "my.git", "VENV", ".Git", "venv2/x"] {
            assert!(policy.check_lexical(raw).is_ok(), "expected allow for {raw}");
        }
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(is_violation(policy().check_lexical("  ")));
    }

    #[test]
    fn normalize_refuses_to_climb_past_filesystem_root() {
        assert_eq!(normalize_lexical(Path::new("/../etc")), None);
        assert_eq!(
            normalize_lexical(Path::new("/a/./b/../c")),
            Some(PathBuf::from("/a/c"))
        );
    }
}
