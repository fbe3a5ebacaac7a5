//! Workspace mutation engine.
//!
//! Every operation resolves its paths through the [`Gateway`] before touching
//! the filesystem. Mutations are appended to the audit trail.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, instrument, warn};

use crate::core::action::{ExecutionResult, ResultStatus};
use crate::core::integrity::IntegrityRegistry;
use crate::core::patch::{Patch, looks_like_unified_diff};
use crate::error::AgentError;
use crate::io::audit::{AuditRecord, AuditTrail};
use crate::io::gateway::{Gateway, NormalizedPath};
use crate::io::walk::{DEFAULT_TREE_DEPTH, Walk, list_relative, render_tree};

/// Lines of unified diff shown when an edit is reported or rejected.
pub const DIFF_PREVIEW_LINES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct EditLimits {
    /// Proposals touching more lines than this are rejected outright.
    pub max_changed_lines: usize,
    pub tree_depth: usize,
}

impl Default for EditLimits {
    fn default() -> Self {
        Self {
            max_changed_lines: 50,
            tree_depth: DEFAULT_TREE_DEPTH,
        }
    }
}

pub struct Workspace {
    gateway: Gateway,
    integrity: IntegrityRegistry,
    audit: AuditTrail,
    limits: EditLimits,
}

impl Workspace {
    pub fn new(
        gateway: Gateway,
        integrity: IntegrityRegistry,
        audit: AuditTrail,
        limits: EditLimits,
    ) -> Self {
        Self {
            gateway,
            integrity,
            audit,
            limits,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn root(&self) -> &Path {
        self.gateway.root()
    }

    #[instrument(skip_all, fields(path = raw))]
    pub fn create_directory(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let target = self.gateway.validate(raw)?;
        match fs::symlink_metadata(&target.absolute) {
            Ok(meta) if meta.is_dir() => {
                return Ok(ExecutionResult::success(format!(
                    "Directory {} already exists; nothing changed",
                    target.display()
                )));
            }
            Ok(_) => return Err(AgentError::AlreadyExists(target.relative)),
            Err(_) => {}
        }
        let result = fs::create_dir_all(&target.absolute)
            .map_err(|e| AgentError::fs(&target.relative, e))
            .map(|()| ExecutionResult::success(format!("Created directory {}", target.display())));
        self.audited("create_directory", &[&target], result)
    }

    #[instrument(skip_all, fields(path = raw))]
    pub fn create_file(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let target = self.gateway.validate(raw)?;
        match fs::symlink_metadata(&target.absolute) {
            Ok(meta) if meta.is_file() => {
                return Ok(ExecutionResult::success(format!(
                    "File {} already exists; nothing changed",
                    target.display()
                )));
            }
            Ok(_) => return Err(AgentError::AlreadyExists(target.relative)),
            Err(_) => {}
        }
        let result = ensure_parent(&target)
            .and_then(|()| {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target.absolute)
                    .map_err(|e| AgentError::fs(&target.relative, e))
            })
            .map(|_| ExecutionResult::success(format!("Created file {}", target.display())));
        self.audited("create_file", &[&target], result)
    }

    /// Full content, numbered for display.
    #[instrument(skip_all, fields(path = raw))]
    pub fn read_file(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let (target, content) = self.read_text(raw)?;
        Ok(ExecutionResult::success(format!(
            "Read {} ({} lines)",
            target.display(),
            content.lines().count()
        ))
        .with_payload(number_lines(&content)))
    }

    /// Validated path plus current UTF-8 content of an existing file.
    pub fn read_text(&self, raw: &str) -> Result<(NormalizedPath, String), AgentError> {
        let target = self.gateway.validate(raw)?;
        if !target.absolute.is_file() {
            return Err(AgentError::NotFound(target.relative));
        }
        let content =
            fs::read_to_string(&target.absolute).map_err(|e| AgentError::fs(&target.relative, e))?;
        Ok((target, content))
    }

    /// Replace (or create) a file with `content`.
    #[instrument(skip_all, fields(path = raw, bytes = content.len()))]
    pub fn write_file(&self, raw: &str, content: &str) -> Result<ExecutionResult, AgentError> {
        let target = self.gateway.validate(raw)?;
        if target.absolute.is_dir() {
            return Err(AgentError::AlreadyExists(target.relative));
        }
        let existed = target.absolute.exists();
        let result = ensure_parent(&target)
            .and_then(|()| write_atomic(&write_destination(&target), content))
            .map(|()| {
                let verb = if existed { "Wrote" } else { "Created" };
                ExecutionResult::success(format!(
                    "{verb} {} ({} lines)",
                    target.display(),
                    content.lines().count()
                ))
            });
        self.audited("write_file", &[&target], result)
    }

    /// Diff-aware modification.
    ///
    /// `proposal` is either the complete new content or a unified diff against
    /// the current content. The file either ends in the new state, having passed
    /// its integrity checks, or stays byte-identical to its snapshot. Emptying a
    /// non-empty file is rejected unless `allow_empty` is set.
    #[instrument(skip_all, fields(path = raw, allow_empty))]
    pub fn modify_file(
        &self,
        raw: &str,
        proposal: &str,
        allow_empty: bool,
    ) -> Result<ExecutionResult, AgentError> {
        let (target, snapshot) = self.read_text(raw)?;
        let result = self.apply_modification(&target, &snapshot, proposal, allow_empty);
        self.audited("modify_file", &[&target], result)
    }

    fn apply_modification(
        &self,
        target: &NormalizedPath,
        snapshot: &str,
        proposal: &str,
        allow_empty: bool,
    ) -> Result<ExecutionResult, AgentError> {
        let integrity_failure = |reason: String| AgentError::IntegrityCheckFailed {
            path: target.relative.clone(),
            reason,
        };

        let patch = if looks_like_unified_diff(proposal) {
            Patch::parse_unified(proposal).map_err(|e| integrity_failure(e.to_string()))?
        } else {
            Patch::compute(snapshot, proposal)
        };
        if patch.is_empty() {
            return Ok(ExecutionResult::success(format!(
                "No changes to {}",
                target.display()
            )));
        }

        let diff = patch.render_unified(&target.display());
        let preview = preview(&diff);
        let changed = patch.changed_lines();
        if changed > self.limits.max_changed_lines {
            return Err(integrity_failure(format!(
                "proposal changes {changed} lines, limit is {}; rejected to avoid an accidental overwrite\n{preview}",
                self.limits.max_changed_lines
            )));
        }

        let updated = patch
            .apply(snapshot)
            .map_err(|e| integrity_failure(format!("patch does not apply cleanly: {e}")))?;
        self.integrity
            .verify(&target.relative, snapshot, &updated, allow_empty)
            .map_err(integrity_failure)?;

        let destination = write_destination(target);
        write_atomic(&destination, &updated)?;

        let on_disk = fs::read_to_string(&destination).map_err(|e| AgentError::fs(&target.relative, e));
        if !matches!(&on_disk, Ok(text) if *text == updated) {
            warn!(path = %target.display(), "post-write verification failed, restoring snapshot");
            write_atomic(&destination, snapshot)?;
            return Err(integrity_failure(
                "written content did not match the verified edit; snapshot restored".to_string(),
            ));
        }

        debug!(path = %target.display(), changed, "file modified");
        Ok(ExecutionResult::success(format!(
            "Modified {} ({changed} lines changed)",
            target.display()
        ))
        .with_payload(preview))
    }

    #[instrument(skip_all, fields(path = raw))]
    pub fn delete_path(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let target = self.gateway.validate(raw)?;
        if target.is_root() {
            return Err(AgentError::path_security(raw, "refusing to delete the workspace root"));
        }
        let meta = fs::symlink_metadata(&target.absolute)
            .map_err(|_| AgentError::NotFound(target.relative.clone()))?;
        let result = if meta.is_dir() {
            fs::remove_dir_all(&target.absolute)
        } else {
            fs::remove_file(&target.absolute)
        }
        .map_err(|e| AgentError::fs(&target.relative, e))
        .map(|()| ExecutionResult::success(format!("Deleted {}", target.display())));
        self.audited("delete_path", &[&target], result)
    }

    #[instrument(skip_all, fields(source = source, destination = destination))]
    pub fn move_path(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<ExecutionResult, AgentError> {
        let from = self.gateway.validate(source)?;
        let to = self.gateway.validate(destination)?;
        if from.is_root() || to.is_root() {
            return Err(AgentError::path_security(
                if from.is_root() { source } else { destination },
                "cannot move the workspace root",
            ));
        }
        if fs::symlink_metadata(&from.absolute).is_err() {
            return Err(AgentError::NotFound(from.relative));
        }
        if from.absolute == to.absolute {
            return Err(invalid_move(&to, "source and destination are the same path"));
        }
        if to.absolute.starts_with(&from.absolute) || from.absolute.starts_with(&to.absolute) {
            return Err(invalid_move(&to, "source and destination overlap"));
        }
        let existing = fs::symlink_metadata(&to.absolute).ok();
        if existing.is_some() && !overwrite {
            return Err(AgentError::DestinationExists(to.relative));
        }
        let result = ensure_parent(&to)
            .and_then(|()| match existing {
                Some(meta) => replace_path(&from, &to, meta.is_dir()),
                None => fs::rename(&from.absolute, &to.absolute)
                    .map_err(|e| AgentError::fs(&from.relative, e)),
            })
            .map(|()| ExecutionResult::success(format!("Moved {} to {}", from.display(), to.display())));
        self.audited("move_path", &[&from, &to], result)
    }

    pub fn show_tree(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let (target, walk) = self.walk(raw)?;
        let label = if target.is_root() {
            ".".to_string()
        } else {
            target.display()
        };
        let tree = render_tree(&walk, &label);
        Ok(ExecutionResult::success(format!("Tree of {}", target.display())).with_payload(tree))
    }

    pub fn list_paths(&self, raw: &str) -> Result<ExecutionResult, AgentError> {
        let (target, walk) = self.walk(raw)?;
        let listed = list_relative(&walk, &target.relative);
        let message = format!("{} entries under {}", listed.len(), target.display());
        Ok(ExecutionResult::success(message).with_payload(listed.join("\n")))
    }

    fn walk(&self, raw: &str) -> Result<(NormalizedPath, Walk), AgentError> {
        let target = self.gateway.validate(raw)?;
        if !target.absolute.is_dir() {
            return Err(AgentError::NotFound(target.relative));
        }
        let walk = Walk::new(&target.absolute, self.limits.tree_depth, self.gateway.policy());
        Ok((target, walk))
    }

    fn audited(
        &self,
        op: &str,
        targets: &[&NormalizedPath],
        result: Result<ExecutionResult, AgentError>,
    ) -> Result<ExecutionResult, AgentError> {
        let paths = targets.iter().map(|t| t.display()).collect();
        let record = match &result {
            Ok(_) => AuditRecord::new(op, paths, ResultStatus::Success),
            Err(err) => AuditRecord::new(op, paths, ResultStatus::Failure).with_detail(err.class()),
        };
        if let Err(err) = self.audit.record(&record) {
            warn!(err = %err, op, "failed to append audit record");
        }
        result
    }
}

fn ensure_parent(target: &NormalizedPath) -> Result<(), AgentError> {
    match target.absolute.parent() {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(|e| AgentError::fs(&target.relative, e))
        }
        None => Ok(()),
    }
}

fn invalid_move(target: &NormalizedPath, reason: &str) -> AgentError {
    AgentError::fs(
        &target.relative,
        std::io::Error::new(ErrorKind::InvalidInput, reason),
    )
}

/// Move `from` over an existing `to`.
///
/// The old destination is set aside next to itself first and only deleted once
/// the rename succeeded; a failed rename puts it back.
fn replace_path(
    from: &NormalizedPath,
    to: &NormalizedPath,
    to_is_dir: bool,
) -> Result<(), AgentError> {
    let name = to
        .absolute
        .file_name()
        .ok_or_else(|| invalid_move(to, "destination has no file name"))?;
    let aside = to
        .absolute
        .with_file_name(format!(".{}.pai-replaced", name.to_string_lossy()));
    fs::rename(&to.absolute, &aside).map_err(|e| AgentError::fs(&to.relative, e))?;

    if let Err(e) = fs::rename(&from.absolute, &to.absolute) {
        if let Err(restore) = fs::rename(&aside, &to.absolute) {
            warn!(
                err = %restore,
                path = %aside.display(),
                "could not restore replaced destination"
            );
        }
        return Err(AgentError::fs(&from.relative, e));
    }

    let cleanup = if to_is_dir {
        fs::remove_dir_all(&aside)
    } else {
        fs::remove_file(&aside)
    };
    if let Err(e) = cleanup {
        warn!(err = %e, path = %aside.display(), "failed to remove replaced destination");
    }
    Ok(())
}

/// Writes land on the link target when the path is an in-workspace symlink.
fn write_destination(target: &NormalizedPath) -> std::path::PathBuf {
    fs::canonicalize(&target.absolute).unwrap_or_else(|_| target.absolute.clone())
}

/// Temp file in the same directory, then rename over the target.
fn write_atomic(target: &Path, contents: &str) -> Result<(), AgentError> {
    let parent = target
        .parent()
        .ok_or_else(|| AgentError::fs(target, ErrorKind::InvalidInput.into()))?;
    let name = target
        .file_name()
        .ok_or_else(|| AgentError::fs(target, ErrorKind::InvalidInput.into()))?;
    let tmp = parent.join(format!(".{}.pai-tmp", name.to_string_lossy()));
    fs::write(&tmp, contents).map_err(|e| AgentError::fs(&tmp, e))?;
    if let Ok(meta) = fs::metadata(target)
        && let Err(e) = fs::set_permissions(&tmp, meta.permissions())
    {
        warn!(err = %e, path = %target.display(), "could not carry permissions over");
    }
    if let Err(e) = fs::rename(&tmp, target) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!(err = %cleanup, path = %tmp.display(), "failed to remove temp file");
        }
        return Err(AgentError::fs(target, e));
    }
    Ok(())
}

fn number_lines(content: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {line}\n", i + 1))
        .collect()
}

fn preview(diff: &str) -> String {
    let total = diff.lines().count();
    let mut out = diff
        .lines()
        .take(DIFF_PREVIEW_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    let more = total.saturating_sub(DIFF_PREVIEW_LINES);
    if more > 0 {
        out.push_str(&format!("\n... ({more} more diff lines)"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let temp = tempfile::tempdir().expect("tempdir");
        let gateway = Gateway::new(temp.path()).expect("gateway");
        let audit = AuditTrail::open(&gateway.root().join(".pai_history")).expect("audit");
        let ws = Workspace::new(
            gateway,
            IntegrityRegistry::with_defaults(200),
            audit,
            EditLimits::default(),
        );
        (temp, ws)
    }

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    #[test]
    fn create_is_idempotent_and_not_audited_twice() {
        let (_temp, ws) = workspace();
        assert!(ws.create_directory("proj").expect("mkdir").is_success());
        let again = ws.create_directory("proj").expect("mkdir again");
        assert!(again.message.contains("already exists"));
        assert!(ws.create_file("proj/main.py").expect("touch").is_success());
        assert!(ws.create_file("proj/main.py").expect("touch again").is_success());
        let records = AuditTrail::open(&ws.root().join(".pai_history"))
            .expect("audit")
            .read_all()
            .expect("read");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn create_file_over_directory_is_already_exists() {
        let (_temp, ws) = workspace();
        ws.create_directory("d").expect("mkdir");
        assert!(matches!(ws.create_file("d"), Err(AgentError::AlreadyExists(_))));
    }

    #[test]
    fn read_denied_path_returns_no_content() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join(".env"), "SECRET=1").expect("write");
        assert!(matches!(ws.read_file(".env"), Err(AgentError::PathSecurity { .. })));
    }

    #[test]
    fn read_numbers_lines_but_read_text_stays_raw() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join("app.py"), "first\nsecond\n").expect("write");
        let result = ws.read_file("app.py").expect("read");
        assert_eq!(
            result.payload.as_deref(),
            Some("   1 | first\n   2 | second\n")
        );
        let (_, raw) = ws.read_text("app.py").expect("read text");
        assert_eq!(raw, "first\nsecond\n");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let (_temp, ws) = workspace();
        assert!(matches!(ws.read_file("nope.txt"), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn modify_with_full_content_applies_patch() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join("app.py"), "def f():\n    return 1\n").expect("write");
        let result = ws
            .modify_file("app.py", "def f():\n    return 2\n", false)
            .expect("modify");
        assert!(result.is_success());
        assert!(result.payload.as_deref().unwrap_or_default().contains("+    return 2"));
        let after = fs::read_to_string(temp.path().join("app.py")).expect("read");
        assert_eq!(after, "def f():\n    return 2\n");
    }

    #[test]
    fn modify_with_mismatched_diff_leaves_file_untouched() {
        let (temp, ws) = workspace();
        let original = "def f():\n    return 1\n";
        fs::write(temp.path().join("app.py"), original).expect("write");
        let diff = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n def g():\n-    return 7\n+    return 8\n";
        let err = ws.modify_file("app.py", diff, false).unwrap_err();
        assert!(matches!(err, AgentError::IntegrityCheckFailed { .. }));
        let after = fs::read(temp.path().join("app.py")).expect("read");
        assert_eq!(after, original.as_bytes());
    }

    #[test]
    fn modify_rejects_broken_syntax_without_touching_file() {
        let (temp, ws) = workspace();
        let original = "{\"a\": 1}\n";
        fs::write(temp.path().join("cfg.json"), original).expect("write");
        let err = ws.modify_file("cfg.json", "{\"a\": \n", false).unwrap_err();
        assert!(matches!(err, AgentError::IntegrityCheckFailed { .. }));
        assert_eq!(fs::read_to_string(temp.path().join("cfg.json")).expect("read"), original);
    }

    #[test]
    fn modify_rejects_oversized_proposals_with_preview() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join("notes.txt"), numbered(40)).expect("write");
        let replacement: String = (1..=40).map(|i| format!("changed {i}\n")).collect();
        let err = ws.modify_file("notes.txt", &replacement, false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("limit is 50"));
        assert!(message.contains("more diff lines"));
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.txt")).expect("read"),
            numbered(40)
        );
    }

    #[test]
    fn modify_with_identical_content_reports_no_changes() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join("a.txt"), "same\n").expect("write");
        let result = ws.modify_file("a.txt", "same\n", false).expect("modify");
        assert!(result.message.starts_with("No changes"));
    }

    #[test]
    fn emptying_a_file_needs_explicit_permission() {
        let (temp, ws) = workspace();
        fs::write(temp.path().join("notes.txt"), "keep me\n").expect("write");
        let err = ws.modify_file("notes.txt", "", false).unwrap_err();
        assert!(err.to_string().contains("zero length"));
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.txt")).expect("read"),
            "keep me\n"
        );

        ws.modify_file("notes.txt", "", true).expect("explicit clear");
        assert_eq!(fs::read_to_string(temp.path().join("notes.txt")).expect("read"), "");
    }

    #[test]
    fn write_file_creates_parents() {
        let (temp, ws) = workspace();
        ws.write_file("src/pkg/mod.py", "x = 1\n").expect("write");
        assert_eq!(
            fs::read_to_string(temp.path().join("src/pkg/mod.py")).expect("read"),
            "x = 1\n"
        );
    }

    #[test]
    fn delete_and_move() {
        let (temp, ws) = workspace();
        ws.write_file("a.txt", "a\n").expect("write");
        ws.write_file("b.txt", "b\n").expect("write");
        assert!(matches!(
            ws.move_path("a.txt", "b.txt", false),
            Err(AgentError::DestinationExists(_))
        ));
        ws.move_path("a.txt", "b.txt", true).expect("overwrite move");
        assert_eq!(fs::read_to_string(temp.path().join("b.txt")).expect("read"), "a\n");
        assert!(!temp.path().join("a.txt").exists());
        ws.delete_path("b.txt").expect("delete");
        assert!(!temp.path().join("b.txt").exists());
        assert!(matches!(ws.delete_path("b.txt"), Err(AgentError::NotFound(_))));
        assert!(matches!(ws.delete_path("."), Err(AgentError::PathSecurity { .. })));
    }

    #[test]
    fn move_onto_itself_keeps_the_file() {
        let (temp, ws) = workspace();
        ws.write_file("keep.txt", "keep\n").expect("write");
        assert!(matches!(
            ws.move_path("keep.txt", "keep.txt", true),
            Err(AgentError::FileSystem { .. })
        ));
        assert_eq!(
            fs::read_to_string(temp.path().join("keep.txt")).expect("read"),
            "keep\n"
        );
    }

    #[test]
    fn move_onto_an_ancestor_or_descendant_is_rejected() {
        let (temp, ws) = workspace();
        ws.write_file("a/b/data.txt", "data\n").expect("write");
        assert!(matches!(
            ws.move_path("a/b", "a", true),
            Err(AgentError::FileSystem { .. })
        ));
        assert!(matches!(
            ws.move_path("a", "a/b/c", true),
            Err(AgentError::FileSystem { .. })
        ));
        assert_eq!(
            fs::read_to_string(temp.path().join("a/b/data.txt")).expect("read"),
            "data\n"
        );
    }

    #[test]
    fn overwriting_move_replaces_a_directory_and_leaves_no_leftovers() {
        let (temp, ws) = workspace();
        ws.write_file("new/fresh.txt", "fresh\n").expect("write");
        ws.write_file("old/stale.txt", "stale\n").expect("write");
        ws.move_path("new", "old", true).expect("overwrite move");
        assert!(temp.path().join("old/fresh.txt").is_file());
        assert!(!temp.path().join("old/stale.txt").exists());
        assert!(!temp.path().join("new").exists());
        assert!(!temp.path().join(".old.pai-replaced").exists());
    }

    #[test]
    fn failed_replacement_restores_the_destination() {
        let (temp, ws) = workspace();
        ws.write_file("dir/inner.txt", "inner\n").expect("write");
        let missing = ws.gateway().validate("missing.txt").expect("validate");
        let dir = ws.gateway().validate("dir").expect("validate");

        assert!(matches!(
            replace_path(&missing, &dir, true),
            Err(AgentError::FileSystem { .. })
        ));
        assert!(temp.path().join("dir/inner.txt").is_file());
        assert!(!temp.path().join(".dir.pai-replaced").exists());
    }

    #[test]
    fn tree_and_listing_hide_state_directory() {
        let (_temp, ws) = workspace();
        ws.create_directory("proj").expect("mkdir");
        ws.create_file("proj/main.py").expect("touch");
        let tree = ws.show_tree("proj").expect("tree");
        assert_eq!(tree.payload.as_deref(), Some("proj/\n└── main.py\n"));
        let root_listing = ws.list_paths(".").expect("list");
        assert_eq!(root_listing.payload.as_deref(), Some("proj/\nproj/main.py"));
    }
}
