//! Line-level diff and patch engine used by diff-aware file modification.
//!
//! Lines keep their terminators, so applying a computed patch to its source
//! reproduces the target byte for byte. Hunks are verified against the
//! content they are applied to; a hunk whose context cannot be located fails
//! the whole application and nothing partial is returned.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

/// Context lines kept around each change when computing a patch.
pub const DEFAULT_CONTEXT: usize = 3;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("malformed diff: {0}")]
    Malformed(String),
    #[error("hunk {hunk} does not match current content near line {line}")]
    ContextMismatch { hunk: usize, line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
}

impl HunkLine {
    fn text(&self) -> &str {
        match self {
            HunkLine::Context(s) | HunkLine::Delete(s) | HunkLine::Insert(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Zero-based index of the first old line this hunk covers.
    pub old_start: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_side(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(s) | HunkLine::Delete(s) => Some(s.as_str()),
            HunkLine::Insert(_) => None,
        })
    }

    fn new_side(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(s) | HunkLine::Insert(s) => Some(s.as_str()),
            HunkLine::Delete(_) => None,
        })
    }

    fn old_len(&self) -> usize {
        self.old_side().count()
    }

    fn new_len(&self) -> usize {
        self.new_side().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal(usize),
    Delete(usize),
    Insert(usize),
}

impl Patch {
    /// Compute the patch turning `old` into `new`.
    pub fn compute(old: &str, new: &str) -> Self {
        Self::compute_with_context(old, new, DEFAULT_CONTEXT)
    }

    pub fn compute_with_context(old: &str, new: &str, context: usize) -> Self {
        let a = split_lines(old);
        let b = split_lines(new);
        let script = diff_lines(&a, &b);
        Self {
            hunks: group_hunks(&script, &a, &b, context),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Number of inserted plus deleted lines.
    pub fn changed_lines(&self) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|line| !matches!(line, HunkLine::Context(_)))
            .count()
    }

    /// Apply to `original`, verifying every hunk's context.
    ///
    /// Hunks are located at their recorded offset first; if the content there
    /// differs, the nearest exact match after the previous hunk is used. No
    /// match at all is a [`PatchError::ContextMismatch`].
    pub fn apply(&self, original: &str) -> Result<String, PatchError> {
        let lines = split_lines(original);
        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        let mut cursor = 0usize;

        for (idx, hunk) in self.hunks.iter().enumerate() {
            let old: Vec<&str> = hunk.old_side().collect();
            let start = locate(&lines, &old, hunk.old_start, cursor).ok_or(
                PatchError::ContextMismatch {
                    hunk: idx + 1,
                    line: hunk.old_start + 1,
                },
            )?;
            out.extend_from_slice(&lines[cursor..start]);
            out.extend(hunk.new_side());
            cursor = start + old.len();
        }
        out.extend_from_slice(&lines[cursor..]);
        Ok(out.concat())
    }

    /// Render as a unified diff with `a/` and `b/` prefixed file names.
    pub fn render_unified(&self, path: &str) -> String {
        let mut out = String::new();
        if self.hunks.is_empty() {
            return out;
        }
        let _ = writeln!(out, "--- a/{path}");
        let _ = writeln!(out, "+++ b/{path}");
        let mut shift: isize = 0;
        for hunk in &self.hunks {
            let old_len = hunk.old_len();
            let new_len = hunk.new_len();
            let old_start = if old_len == 0 { hunk.old_start } else { hunk.old_start + 1 };
            let new_base = hunk.old_start as isize + shift;
            let new_start = if new_len == 0 { new_base } else { new_base + 1 };
            let _ = writeln!(out, "@@ -{old_start},{old_len} +{new_start},{new_len} @@");
            for line in &hunk.lines {
                let marker = match line {
                    HunkLine::Context(_) => ' ',
                    HunkLine::Delete(_) => '-',
                    HunkLine::Insert(_) => '+',
                };
                let text = line.text();
                out.push(marker);
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push_str("\n\\ No newline at end of file\n");
                }
            }
            shift += new_len as isize - old_len as isize;
        }
        out
    }

    /// Parse a unified diff (single file). File header lines are optional.
    pub fn parse_unified(text: &str) -> Result<Self, PatchError> {
        let mut hunks: Vec<Hunk> = Vec::new();
        let mut current: Option<Hunk> = None;

        for raw in text.lines() {
            if let Some(caps) = HUNK_HEADER_RE.captures(raw) {
                if let Some(done) = current.take() {
                    hunks.push(done);
                }
                let old_start: usize = caps[1]
                    .parse()
                    .map_err(|_| PatchError::Malformed(format!("bad hunk header '{raw}'")))?;
                let old_len: usize = match caps.get(2) {
                    Some(m) => m
                        .as_str()
                        .parse()
                        .map_err(|_| PatchError::Malformed(format!("bad hunk header '{raw}'")))?,
                    None => 1,
                };
                let zero_based = if old_len == 0 {
                    old_start
                } else {
                    old_start.saturating_sub(1)
                };
                current = Some(Hunk {
                    old_start: zero_based,
                    lines: Vec::new(),
                });
                continue;
            }

            let Some(hunk) = current.as_mut() else {
                if raw.starts_with("---") || raw.starts_with("+++") || raw.starts_with("diff ") {
                    continue;
                }
                if raw.trim().is_empty() {
                    continue;
                }
                return Err(PatchError::Malformed(format!(
                    "content before first hunk header: '{raw}'"
                )));
            };

            if raw.starts_with('\\') {
                // "\ No newline at end of file" strips the previous terminator.
                if let Some(last) = hunk.lines.last_mut() {
                    let text = match last {
                        HunkLine::Context(s) | HunkLine::Delete(s) | HunkLine::Insert(s) => s,
                    };
                    if text.ends_with('\n') {
                        text.pop();
                    }
                }
                continue;
            }

            let (marker, body) = match raw.chars().next() {
                Some(ch @ (' ' | '-' | '+')) => (ch, &raw[1..]),
                None => (' ', ""),
                Some(_) => {
                    return Err(PatchError::Malformed(format!(
                        "unexpected line in hunk: '{raw}'"
                    )));
                }
            };
            let line = format!("{body}\n");
            hunk.lines.push(match marker {
                '-' => HunkLine::Delete(line),
                '+' => HunkLine::Insert(line),
                _ => HunkLine::Context(line),
            });
        }

        if let Some(done) = current.take() {
            hunks.push(done);
        }
        if hunks.is_empty() {
            return Err(PatchError::Malformed("no hunks found".to_string()));
        }
        Ok(Self { hunks })
    }
}

/// Heuristic: does model output look like a unified diff rather than file content?
pub fn looks_like_unified_diff(text: &str) -> bool {
    let mut saw_header = false;
    for line in text.lines().take(20) {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            saw_header = true;
            continue;
        }
        if HUNK_HEADER_RE.is_match(line) {
            return true;
        }
        if !saw_header && !line.trim().is_empty() {
            return false;
        }
    }
    false
}

/// Split into lines, each keeping its `\n` terminator.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn same_line(a: &str, b: &str) -> bool {
    a.trim_end_matches(['\n', '\r']) == b.trim_end_matches(['\n', '\r'])
}

fn matches_at(lines: &[&str], old: &[&str], start: usize) -> bool {
    start + old.len() <= lines.len()
        && lines[start..start + old.len()]
            .iter()
            .zip(old)
            .all(|(have, want)| same_line(have, want))
}

fn locate(lines: &[&str], old: &[&str], hint: usize, cursor: usize) -> Option<usize> {
    if old.is_empty() {
        return Some(hint.clamp(cursor, lines.len()));
    }
    if hint >= cursor && matches_at(lines, old, hint) {
        return Some(hint);
    }
    (cursor..=lines.len().saturating_sub(old.len()))
        .filter(|&start| matches_at(lines, old, start))
        .min_by_key(|&start| start.abs_diff(hint))
}

/// Myers shortest edit script over lines, after trimming the common prefix
/// and suffix.
fn diff_lines(a: &[&str], b: &[&str]) -> Vec<Edit> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut script: Vec<Edit> = (0..prefix).map(Edit::Equal).collect();
    for edit in myers(a_mid, b_mid) {
        script.push(match edit {
            Edit::Equal(i) => Edit::Equal(i + prefix),
            Edit::Delete(i) => Edit::Delete(i + prefix),
            Edit::Insert(j) => Edit::Insert(j + prefix),
        });
    }
    script.extend((a.len() - suffix..a.len()).map(Edit::Equal));
    script
}

fn myers(a: &[&str], b: &[&str]) -> Vec<Edit> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    if max == 0 {
        return Vec::new();
    }
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 2];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'outer: for d in 0..=max as isize {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'outer;
            }
            k += 2;
        }
    }

    // Backtrack from (n, m) through the recorded frontiers.
    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let idx = (k + offset) as usize;
        let prev_k = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            edits.push(Edit::Equal(x as usize));
        }
        if d > 0 {
            if x == prev_x {
                y -= 1;
                edits.push(Edit::Insert(y as usize));
            } else {
                x -= 1;
                edits.push(Edit::Delete(x as usize));
            }
        }
    }
    edits.reverse();
    edits
}

fn group_hunks(script: &[Edit], a: &[&str], b: &[&str], context: usize) -> Vec<Hunk> {
    let change_positions: Vec<usize> = script
        .iter()
        .enumerate()
        .filter(|(_, e)| !matches!(e, Edit::Equal(_)))
        .map(|(i, _)| i)
        .collect();
    if change_positions.is_empty() {
        return Vec::new();
    }

    // Merge change runs whose surrounding context would overlap.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &pos in &change_positions {
        let lo = pos.saturating_sub(context);
        let hi = (pos + context + 1).min(script.len());
        match ranges.last_mut() {
            Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
            _ => ranges.push((lo, hi)),
        }
    }

    ranges
        .into_iter()
        .map(|(lo, hi)| {
            let old_start = script[..lo]
                .iter()
                .filter(|e| !matches!(e, Edit::Insert(_)))
                .count();
            let lines = script[lo..hi]
                .iter()
                .map(|edit| match *edit {
                    Edit::Equal(i) => HunkLine::Context(a[i].to_string()),
                    Edit::Delete(i) => HunkLine::Delete(a[i].to_string()),
                    Edit::Insert(j) => HunkLine::Insert(b[j].to_string()),
                })
                .collect();
            Hunk { old_start, lines }
        })
        .collect()
}
