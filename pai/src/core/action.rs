//! Typed actions and their execution results.
//!
//! Every model-proposed step is one [`Action`]. Path-bearing variants carry the
//! raw path string exactly as the model wrote it; normalization happens in the
//! gateway, never here.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

static CLEAR_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(clear|empty|blank|wipe|truncate)\b").expect("valid clear-intent regex")
});

/// Wire tag for each action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTag {
    CreateDirectory,
    CreateFile,
    ReadFile,
    WriteFile,
    ModifyFile,
    DeletePath,
    MovePath,
    ShowTree,
    ListPaths,
    Execute,
    ExecuteInput,
    Finish,
}

impl ActionTag {
    pub const ALL: [ActionTag; 12] = [
        ActionTag::CreateDirectory,
        ActionTag::CreateFile,
        ActionTag::ReadFile,
        ActionTag::WriteFile,
        ActionTag::ModifyFile,
        ActionTag::DeletePath,
        ActionTag::MovePath,
        ActionTag::ShowTree,
        ActionTag::ListPaths,
        ActionTag::Execute,
        ActionTag::ExecuteInput,
        ActionTag::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionTag::CreateDirectory => "CREATE_DIRECTORY",
            ActionTag::CreateFile => "CREATE_FILE",
            ActionTag::ReadFile => "READ_FILE",
            ActionTag::WriteFile => "WRITE_FILE",
            ActionTag::ModifyFile => "MODIFY_FILE",
            ActionTag::DeletePath => "DELETE_PATH",
            ActionTag::MovePath => "MOVE_PATH",
            ActionTag::ShowTree => "SHOW_TREE",
            ActionTag::ListPaths => "LIST_PATHS",
            ActionTag::Execute => "EXECUTE",
            ActionTag::ExecuteInput => "EXECUTE_INPUT",
            ActionTag::Finish => "FINISH",
        }
    }

    /// Match a tag case-insensitively. Short legacy spellings are accepted too.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        let tag = match upper.as_str() {
            "CREATE_DIRECTORY" | "MKDIR" => ActionTag::CreateDirectory,
            "CREATE_FILE" | "TOUCH" => ActionTag::CreateFile,
            "READ_FILE" | "READ" => ActionTag::ReadFile,
            "WRITE_FILE" | "WRITE" => ActionTag::WriteFile,
            "MODIFY_FILE" => ActionTag::ModifyFile,
            "DELETE_PATH" | "RM" => ActionTag::DeletePath,
            "MOVE_PATH" | "MV" => ActionTag::MovePath,
            "SHOW_TREE" | "TREE" => ActionTag::ShowTree,
            "LIST_PATHS" => ActionTag::ListPaths,
            "EXECUTE" => ActionTag::Execute,
            "EXECUTE_INPUT" => ActionTag::ExecuteInput,
            "FINISH" => ActionTag::Finish,
            _ => return None,
        };
        Some(tag)
    }

    /// Read-only actions never touch the audit trail.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            ActionTag::CreateDirectory
                | ActionTag::CreateFile
                | ActionTag::WriteFile
                | ActionTag::ModifyFile
                | ActionTag::DeletePath
                | ActionTag::MovePath
        )
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Action {
    CreateDirectory {
        path: String,
    },
    CreateFile {
        path: String,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        description: String,
    },
    ModifyFile {
        path: String,
        description: String,
    },
    DeletePath {
        path: String,
    },
    MovePath {
        source: String,
        destination: String,
        overwrite: bool,
    },
    ShowTree {
        path: String,
    },
    ListPaths {
        path: String,
    },
    Execute {
        command: String,
    },
    ExecuteWithInput {
        command: String,
        stdin: String,
    },
    Finish {
        message: String,
    },
}

impl Action {
    pub fn tag(&self) -> ActionTag {
        match self {
            Action::CreateDirectory { .. } => ActionTag::CreateDirectory,
            Action::CreateFile { .. } => ActionTag::CreateFile,
            Action::ReadFile { .. } => ActionTag::ReadFile,
            Action::WriteFile { .. } => ActionTag::WriteFile,
            Action::ModifyFile { .. } => ActionTag::ModifyFile,
            Action::DeletePath { .. } => ActionTag::DeletePath,
            Action::MovePath { .. } => ActionTag::MovePath,
            Action::ShowTree { .. } => ActionTag::ShowTree,
            Action::ListPaths { .. } => ActionTag::ListPaths,
            Action::Execute { .. } => ActionTag::Execute,
            Action::ExecuteWithInput { .. } => ActionTag::ExecuteInput,
            Action::Finish { .. } => ActionTag::Finish,
        }
    }

    /// Every raw path argument this action will touch, in argument order.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Action::CreateDirectory { path }
            | Action::CreateFile { path }
            | Action::ReadFile { path }
            | Action::WriteFile { path, .. }
            | Action::ModifyFile { path, .. }
            | Action::DeletePath { path }
            | Action::ShowTree { path }
            | Action::ListPaths { path } => vec![path.as_str()],
            Action::MovePath {
                source,
                destination,
                ..
            } => vec![source.as_str(), destination.as_str()],
            Action::Execute { .. } | Action::ExecuteWithInput { .. } | Action::Finish { .. } => {
                Vec::new()
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }

    /// A `MODIFY_FILE` whose description asks for the file to end up empty.
    /// Only these edits may truncate a non-empty file to zero length.
    pub fn requests_empty_file(&self) -> bool {
        matches!(
            self,
            Action::ModifyFile { description, .. } if CLEAR_INTENT_RE.is_match(description)
        )
    }

    /// Render back to the `TAG::arg` line format, with newlines in the stdin
    /// payload escaped so the result stays a single line.
    pub fn to_wire(&self) -> String {
        let tag = self.tag().as_str();
        match self {
            Action::CreateDirectory { path }
            | Action::CreateFile { path }
            | Action::ReadFile { path }
            | Action::DeletePath { path }
            | Action::ShowTree { path }
            | Action::ListPaths { path } => format!("{tag}::{path}"),
            Action::WriteFile { path, description } | Action::ModifyFile { path, description } => {
                format!("{tag}::{path}::{description}")
            }
            Action::MovePath {
                source,
                destination,
                overwrite,
            } => {
                if *overwrite {
                    format!("{tag}::{source}::{destination}::overwrite")
                } else {
                    format!("{tag}::{source}::{destination}")
                }
            }
            Action::Execute { command } => format!("{tag}::{command}"),
            Action::ExecuteWithInput { command, stdin } => {
                let escaped = stdin.replace('\\', "\\\\").replace('\n', "\\n");
                format!("{tag}::{command}::{escaped}")
            }
            Action::Finish { message } => format!("{tag}::{message}"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Outcome of executing exactly one action. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    pub message: String,
    /// File content, listing, or process output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Error class name for failures (see [`AgentError::class`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            message: message.into(),
            payload: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            message: message.into(),
            payload: None,
            error: None,
        }
    }

    pub fn from_error(err: &AgentError) -> Self {
        Self {
            status: ResultStatus::Failure,
            message: err.to_string(),
            payload: None,
            error: Some(err.class().to_string()),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_error_class(mut self, class: &str) -> Self {
        self.error = Some(class.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Text fed back to the model as the observation for this step.
    pub fn render(&self) -> String {
        let prefix = match self.status {
            ResultStatus::Success => "Success",
            ResultStatus::Failure => "Error",
        };
        match &self.payload {
            Some(payload) => format!("{prefix}: {}\n{payload}", self.message),
            None => format!("{prefix}: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_modify_descriptions_can_ask_for_an_empty_file() {
        let modify = |description: &str| Action::ModifyFile {
            path: "notes.txt".to_string(),
            description: description.to_string(),
        };
        assert!(modify("Clear the file").requests_empty_file());
        assert!(modify("wipe all notes").requests_empty_file());
        assert!(!modify("rename the helper to clearer_name").requests_empty_file());
        assert!(
            !Action::WriteFile {
                path: "notes.txt".to_string(),
                description: "empty file".to_string(),
            }
            .requests_empty_file()
        );
    }

    #[test]
    fn tags_match_case_insensitively_and_accept_legacy_aliases() {
        assert_eq!(
            ActionTag::from_wire(" create_directory "),
            Some(ActionTag::CreateDirectory)
        );
        assert_eq!(ActionTag::from_wire("MKDIR"), Some(ActionTag::CreateDirectory));
        assert_eq!(ActionTag::from_wire("mv"), Some(ActionTag::MovePath));
        assert_eq!(ActionTag::from_wire("LAUNCH_ROCKET"), None);
    }

    #[test]
    fn every_tag_round_trips_through_its_wire_name() {
        for tag in ActionTag::ALL {
            assert_eq!(ActionTag::from_wire(tag.as_str()), Some(tag));
        }
    }

    #[test]
    fn move_exposes_both_paths_in_order() {
        let action = Action::MovePath {
            source: "a.txt".to_string(),
            destination: "b/a.txt".to_string(),
            overwrite: false,
        };
        assert_eq!(action.paths(), vec!["a.txt", "b/a.txt"]);
        assert!(Action::Execute {
            command: "ls".to_string()
        }
        .paths()
        .is_empty());
    }

    #[test]
    fn stdin_payload_is_escaped_on_the_wire() {
        let action = Action::ExecuteWithInput {
            command: "python prog.py".to_string(),
            stdin: "Alice\n42\n".to_string(),
        };
        assert_eq!(action.to_wire(), "EXECUTE_INPUT::python prog.py::Alice\\n42\\n");
    }

    #[test]
    fn failure_render_carries_error_prefix() {
        let err = AgentError::NotFound("missing.txt".into());
        let result = ExecutionResult::from_error(&err);
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("NotFound"));
        assert!(result.render().starts_with("Error: not found"));
    }
}
