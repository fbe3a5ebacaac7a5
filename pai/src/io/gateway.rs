//! Path-security gateway. Every filesystem-touching action resolves its
//! paths here first.
//!
//! The lexical check comes from [`PathPolicy`]. On top of that the gateway
//! resolves symlinks on the deepest existing ancestor, so a link inside the
//! workspace cannot be used to reach outside it or into a deny-listed
//! directory.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::path_policy::PathPolicy;
use crate::error::AgentError;

/// A path that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    /// Absolute location to operate on. Parent directories are resolved; the
    /// final component is kept as named so links can be moved or deleted.
    pub absolute: PathBuf,
    /// Location relative to the workspace root (empty for the root itself).
    pub relative: PathBuf,
}

impl NormalizedPath {
    /// Root-relative path for messages, `.` for the root.
    pub fn display(&self) -> String {
        if self.relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            self.relative.to_string_lossy().replace('\\', "/")
        }
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Gateway {
    policy: PathPolicy,
}

impl Gateway {
    /// The root is canonicalized once; it must exist.
    pub fn new(root: &Path) -> Result<Self, AgentError> {
        let canonical = fs::canonicalize(root).map_err(|e| AgentError::fs(root, e))?;
        Ok(Self {
            policy: PathPolicy::new(&canonical),
        })
    }

    pub fn with_policy(policy: PathPolicy) -> Self {
        Self { policy }
    }

    pub fn root(&self) -> &Path {
        self.policy.root()
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn validate(&self, raw: &str) -> Result<NormalizedPath, AgentError> {
        let lexical = self.policy.check_lexical(raw)?;
        let root = self.policy.root();
        let lexical_relative = lexical
            .strip_prefix(root)
            .map_err(|_| AgentError::path_security(raw, "path is outside the workspace root"))?;

        if lexical_relative.as_os_str().is_empty() {
            return Ok(NormalizedPath {
                absolute: root.to_path_buf(),
                relative: PathBuf::new(),
            });
        }

        // Where the path actually lands once every link is followed.
        let target = resolve_existing(raw, &lexical)?;
        let target_relative = self.contained(raw, &target)?;
        self.policy.check_components(raw, target_relative)?;

        // The path itself, with only its parent resolved.
        let parent = lexical.parent().unwrap_or(root);
        let name = lexical
            .file_name()
            .ok_or_else(|| AgentError::path_security(raw, "path has no final component"))?;
        let absolute = resolve_existing(raw, parent)?.join(name);
        let relative = self.contained(raw, &absolute)?.to_path_buf();
        self.policy.check_components(raw, &relative)?;

        debug!(raw, relative = %relative.display(), "path validated");
        Ok(NormalizedPath { absolute, relative })
    }

    /// Root-relative display form of an absolute path, if it is inside the root.
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(self.policy.root()).ok()?;
        if rel.as_os_str().is_empty() {
            Some(".".to_string())
        } else {
            Some(rel.to_string_lossy().replace('\\', "/"))
        }
    }

    fn contained<'p>(&self, raw: &str, path: &'p Path) -> Result<&'p Path, AgentError> {
        path.strip_prefix(self.policy.root()).map_err(|_| {
            AgentError::path_security(raw, "path resolves outside the workspace root")
        })
    }
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// missing tail. A dangling symlink anywhere in the tail is rejected because
/// writing through it would create its target.
fn resolve_existing(raw: &str, path: &Path) -> Result<PathBuf, AgentError> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        match fs::canonicalize(&existing) {
            Ok(mut resolved) => {
                for name in tail.iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if fs::symlink_metadata(&existing).is_ok_and(|m| m.file_type().is_symlink()) {
                    return Err(AgentError::path_security(raw, "path crosses a dangling symlink"));
                }
                let Some(name) = existing.file_name() else {
                    return Err(AgentError::fs(path, e));
                };
                tail.push(name.to_os_string());
                if !existing.pop() {
                    return Err(AgentError::fs(path, e));
                }
            }
            Err(e) => return Err(AgentError::fs(path, e)),
        }
    }
}
