//! Typed failure classes for the agent execution core.
//!
//! Most variants are turn-scoped: the controller turns them into a failed
//! [`ExecutionResult`](crate::core::action::ExecutionResult) and keeps the
//! conversation going. Only [`AgentError::InferenceFatal`] and
//! [`AgentError::CredentialExhausted`] end the session.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::state::{SessionEvent, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The plan text could not be turned into any candidate lines at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// A single plan line carried a tag outside the action set.
    #[error("unrecognized action on line {line}: {tag}")]
    UnrecognizedAction { line: usize, tag: String },

    #[error("path security violation for '{path}': {reason}")]
    PathSecurity { path: String, reason: String },

    #[error("filesystem error on {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("destination exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// The edit was rolled back; the file is byte-identical to its snapshot.
    #[error("integrity check failed for {}: {reason}", path.display())]
    IntegrityCheckFailed { path: PathBuf, reason: String },

    #[error("command timed out after {timeout:?}")]
    ShellTimeout { timeout: Duration },

    #[error("network access blocked: command uses '{indicator}'")]
    NetworkBlocked { indicator: String },

    #[error("transient inference failure: {0}")]
    InferenceTransient(String),

    #[error("inference failed: {0}")]
    InferenceFatal(String),

    #[error("no enabled credentials available")]
    CredentialExhausted,

    #[error("invalid session transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },
}

impl AgentError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::FileSystem {
            path: path.into(),
            source,
        }
    }

    pub fn path_security(path: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::PathSecurity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this failure ends the session instead of just the current turn.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InferenceFatal(_) | AgentError::CredentialExhausted
        )
    }

    /// Short stable class name, used in session logs and result messages.
    pub fn class(&self) -> &'static str {
        match self {
            AgentError::Parse(_) => "ParseError",
            AgentError::UnrecognizedAction { .. } => "UnrecognizedAction",
            AgentError::PathSecurity { .. } => "PathSecurityViolation",
            AgentError::FileSystem { .. } => "FileSystemError",
            AgentError::NotFound(_) => "NotFound",
            AgentError::AlreadyExists(_) => "AlreadyExists",
            AgentError::DestinationExists(_) => "DestinationExists",
            AgentError::IntegrityCheckFailed { .. } => "IntegrityCheckFailed",
            AgentError::ShellTimeout { .. } => "ShellTimeout",
            AgentError::NetworkBlocked { .. } => "NetworkBlocked",
            AgentError::InferenceTransient(_) => "InferenceTransientError",
            AgentError::InferenceFatal(_) => "InferenceFatalError",
            AgentError::CredentialExhausted => "CredentialExhausted",
            AgentError::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}
