//! Plan parsing: raw model output -> ordered candidate actions.
//!
//! The parser is line-oriented. Each candidate line is either an action
//! (`TAG::arg1[::arg2[::arg3]]`), free-text commentary (no `::`), or a line
//! the parser rejects. Rejections are per line; they never fail the whole
//! plan. Order is preserved because the controller executes the first valid
//! action only.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::action::{Action, ActionTag};
use crate::error::AgentError;

/// Upper bound on candidate lines regardless of configuration.
pub const HARD_MAX_PLAN_LINES: usize = 200;
pub const DEFAULT_MAX_PLAN_LINES: usize = 50;

static LIST_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*•]\s+|\d+[.)]\s+)").expect("list marker regex is valid")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]+$").expect("tag regex is valid"));

/// Why a line was dropped from the ordered action list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineIssue {
    /// The tag is not part of the action set.
    Unrecognized { tag: String },
    /// The tag is known but its arguments are missing or empty.
    Malformed { tag: ActionTag, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanLine {
    Action(Action),
    Comment(String),
    Rejected { line: usize, raw: String, issue: LineIssue },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Plan {
    pub lines: Vec<PlanLine>,
    /// Candidate lines dropped because the plan exceeded the line cap.
    pub discarded: usize,
}

impl Plan {
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.lines.iter().filter_map(|line| match line {
            PlanLine::Action(action) => Some(action),
            _ => None,
        })
    }

    pub fn first_action(&self) -> Option<&Action> {
        self.actions().next()
    }

    pub fn comments(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            PlanLine::Comment(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Per-line failures as typed errors, in plan order.
    pub fn issues(&self) -> Vec<AgentError> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                PlanLine::Rejected {
                    line,
                    issue: LineIssue::Unrecognized { tag },
                    ..
                } => Some(AgentError::UnrecognizedAction {
                    line: *line,
                    tag: tag.clone(),
                }),
                PlanLine::Rejected {
                    line,
                    issue: LineIssue::Malformed { tag, reason },
                    ..
                } => Some(AgentError::Parse(format!("line {line}: {tag}: {reason}"))),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanParser {
    max_lines: usize,
}

impl Default for PlanParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PLAN_LINES)
    }
}

impl PlanParser {
    /// `max_lines` is clamped to `1..=HARD_MAX_PLAN_LINES`.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.clamp(1, HARD_MAX_PLAN_LINES),
        }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Parse plan text into ordered lines.
    ///
    /// Fails only when the text holds no candidate lines at all.
    pub fn parse(&self, plan_text: &str) -> Result<Plan, AgentError> {
        let candidates: Vec<(usize, &str)> = plan_text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with("```"))
            .collect();

        if candidates.is_empty() {
            return Err(AgentError::Parse("plan contains no candidate lines".to_string()));
        }

        let discarded = candidates.len().saturating_sub(self.max_lines);
        if discarded > 0 {
            warn!(
                max_lines = self.max_lines,
                discarded, "plan exceeds line cap, discarding trailing lines"
            );
        }

        let lines: Vec<PlanLine> = candidates
            .into_iter()
            .take(self.max_lines)
            .map(|(line_no, raw)| parse_line(line_no, raw))
            .collect();

        let plan = Plan { lines, discarded };
        debug!(
            actions = plan.actions().count(),
            rejected = plan.issues().len(),
            "plan parsed"
        );
        Ok(plan)
    }
}

fn parse_line(line_no: usize, raw: &str) -> PlanLine {
    let line = LIST_MARKER_RE.replace(raw, "");
    let line = line.trim().trim_matches('`').trim();

    let (tag_part, args) = match line.split_once("::") {
        Some((tag, rest)) => (tag.trim(), Some(rest)),
        None => (line, None),
    };

    if !TAG_RE.is_match(tag_part) {
        return PlanLine::Comment(raw.to_string());
    }

    let Some(tag) = ActionTag::from_wire(tag_part) else {
        if args.is_none() {
            return PlanLine::Comment(raw.to_string());
        }
        warn!(line = line_no, tag = tag_part, "unrecognized action tag");
        return PlanLine::Rejected {
            line: line_no,
            raw: raw.to_string(),
            issue: LineIssue::Unrecognized {
                tag: tag_part.to_string(),
            },
        };
    };

    // A bare word that happens to match a tag is only an action for tags
    // whose arguments are all optional.
    if args.is_none()
        && !matches!(
            tag,
            ActionTag::Finish | ActionTag::ShowTree | ActionTag::ListPaths
        )
    {
        return PlanLine::Comment(raw.to_string());
    }

    match build_action(tag, args.unwrap_or("")) {
        Ok(action) => PlanLine::Action(action),
        Err(reason) => {
            warn!(line = line_no, %tag, %reason, "malformed action arguments");
            PlanLine::Rejected {
                line: line_no,
                raw: raw.to_string(),
                issue: LineIssue::Malformed { tag, reason },
            }
        }
    }
}

fn build_action(tag: ActionTag, args: &str) -> Result<Action, String> {
    let action = match tag {
        ActionTag::CreateDirectory => Action::CreateDirectory {
            path: required_path(args)?,
        },
        ActionTag::CreateFile => Action::CreateFile {
            path: required_path(args)?,
        },
        ActionTag::ReadFile => Action::ReadFile {
            path: required_path(args)?,
        },
        ActionTag::DeletePath => Action::DeletePath {
            path: required_path(args)?,
        },
        ActionTag::ShowTree => Action::ShowTree {
            path: optional_path(args),
        },
        ActionTag::ListPaths => Action::ListPaths {
            path: optional_path(args),
        },
        ActionTag::WriteFile | ActionTag::ModifyFile => {
            let (path, description) = args
                .split_once("::")
                .ok_or_else(|| "expected path::description".to_string())?;
            let path = required_path(path)?;
            let description = description.trim().to_string();
            if description.is_empty() {
                return Err("description is empty".to_string());
            }
            if tag == ActionTag::WriteFile {
                Action::WriteFile { path, description }
            } else {
                Action::ModifyFile { path, description }
            }
        }
        ActionTag::MovePath => {
            let mut parts = args.splitn(3, "::");
            let source = required_path(parts.next().unwrap_or(""))?;
            let destination = required_path(
                parts
                    .next()
                    .ok_or_else(|| "expected source::destination".to_string())?,
            )?;
            let overwrite = match parts.next().map(|flag| flag.trim().to_ascii_lowercase()) {
                None => false,
                Some(flag) if flag == "overwrite" || flag == "force" => true,
                Some(flag) => return Err(format!("unknown move flag '{flag}'")),
            };
            Action::MovePath {
                source,
                destination,
                overwrite,
            }
        }
        ActionTag::Execute => {
            let command = args.trim();
            if command.is_empty() {
                return Err("command is empty".to_string());
            }
            Action::Execute {
                command: command.to_string(),
            }
        }
        ActionTag::ExecuteInput => {
            let (command, payload) = args
                .split_once("::")
                .ok_or_else(|| "expected command::stdin".to_string())?;
            let command = command.trim();
            if command.is_empty() {
                return Err("command is empty".to_string());
            }
            Action::ExecuteWithInput {
                command: command.to_string(),
                stdin: unescape_payload(payload),
            }
        }
        ActionTag::Finish => {
            let message = args.trim();
            Action::Finish {
                message: if message.is_empty() {
                    "Task is considered complete.".to_string()
                } else {
                    message.to_string()
                },
            }
        }
    };
    Ok(action)
}

fn required_path(raw: &str) -> Result<String, String> {
    let path = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    Ok(path.to_string())
}

fn optional_path(raw: &str) -> String {
    let path = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    if path.is_empty() {
        ".".to_string()
    } else {
        path.to_string()
    }
}

/// Decode a stdin payload: optional surrounding double quotes, and the
/// escapes `\n`, `\t`, `\r`, `\\`, `\"`.
pub fn unescape_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
