//! Lazy, restartable directory traversal with deny-list filtering.
//!
//! Entries are produced depth-first, siblings sorted by name, one directory
//! read at a time. Calling [`Walk::iter`] again starts a fresh traversal.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::path_policy::PathPolicy;
use crate::error::AgentError;

pub const DEFAULT_TREE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Relative to the walk's starting directory.
    pub relative: PathBuf,
    pub name: String,
    /// 1 for direct children of the start.
    pub depth: usize,
    /// Symlinks are reported as files and never descended into.
    pub is_dir: bool,
    /// Last among its siblings.
    pub is_last: bool,
    /// `is_last` of every ancestor between the start and this entry.
    pub ancestors_last: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct Walk {
    start: PathBuf,
    max_depth: usize,
    policy: PathPolicy,
}

impl Walk {
    pub fn new(start: &Path, max_depth: usize, policy: &PathPolicy) -> Self {
        Self {
            start: start.to_path_buf(),
            max_depth: max_depth.max(1),
            policy: policy.clone(),
        }
    }

    pub fn iter(&self) -> WalkIter<'_> {
        let mut iter = WalkIter {
            walk: self,
            stack: Vec::new(),
            lasts: Vec::new(),
            pending_error: None,
        };
        match iter.read_sorted(&self.start, Path::new("")) {
            Ok(children) => iter.stack.push(children.into_iter()),
            Err(err) => iter.pending_error = Some(err),
        }
        iter
    }
}

#[derive(Debug)]
struct DirItem {
    path: PathBuf,
    relative: PathBuf,
    name: String,
    is_dir: bool,
}

pub struct WalkIter<'w> {
    walk: &'w Walk,
    stack: Vec<std::vec::IntoIter<DirItem>>,
    lasts: Vec<bool>,
    pending_error: Option<AgentError>,
}

impl WalkIter<'_> {
    fn read_sorted(&self, dir: &Path, relative: &Path) -> Result<Vec<DirItem>, AgentError> {
        let mut items = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| AgentError::fs(dir, e))? {
            let entry = entry.map_err(|e| AgentError::fs(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.walk.policy.is_denied_name(&name) {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| AgentError::fs(entry.path(), e))?;
            items.push(DirItem {
                path: entry.path(),
                relative: relative.join(&name),
                name,
                is_dir: file_type.is_dir(),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}

impl Iterator for WalkIter<'_> {
    type Item = Result<WalkEntry, AgentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        loop {
            let depth = self.stack.len();
            let top = self.stack.last_mut()?;
            let Some(item) = top.next() else {
                self.stack.pop();
                continue;
            };
            let is_last = top.len() == 0;

            self.lasts.truncate(depth - 1);
            let entry = WalkEntry {
                path: item.path,
                relative: item.relative,
                name: item.name,
                depth,
                is_dir: item.is_dir,
                is_last,
                ancestors_last: self.lasts.clone(),
            };
            self.lasts.push(is_last);

            if entry.is_dir && depth < self.walk.max_depth {
                match self.read_sorted(&entry.path, &entry.relative) {
                    Ok(children) => self.stack.push(children.into_iter()),
                    Err(err) => self.pending_error = Some(err),
                }
            }
            return Some(Ok(entry));
        }
    }
}

/// Render a walk as an ASCII tree headed by `label/`.
///
/// Unreadable directories show up inline instead of aborting the render.
pub fn render_tree(walk: &Walk, label: &str) -> String {
    let mut out = format!("{label}/\n");
    for entry in walk.iter() {
        match entry {
            Ok(entry) => {
                for last in &entry.ancestors_last {
                    out.push_str(if *last { "    " } else { "│   " });
                }
                out.push_str(if entry.is_last { "└── " } else { "├── " });
                out.push_str(&entry.name);
                if entry.is_dir {
                    out.push('/');
                }
                out.push('\n');
            }
            Err(err) => out.push_str(&format!("[unreadable: {err}]\n")),
        }
    }
    out
}

/// Flat, sorted list of root-relative paths (directories end in `/`).
pub fn list_relative(walk: &Walk, prefix: &Path) -> Vec<String> {
    walk.iter()
        .filter_map(Result::ok)
        .map(|entry| {
            let mut line = prefix.join(&entry.relative).to_string_lossy().replace('\\', "/");
            if entry.is_dir {
                line.push('/');
            }
            line
        })
        .collect()
}
