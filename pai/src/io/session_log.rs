//! Per-session turn log under `.pai_history/`.
//!
//! One JSON object per line. The file is flushed after every record so a
//! crashed session still leaves a complete log of the turns it ran.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::action::{Action, ExecutionResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub timestamp: String,
    /// Step number within the current request, starting at 1.
    pub step: usize,
    pub user_input: String,
    /// Raw plan text as returned by the model.
    pub plan: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub executed: Option<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_executed: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub result: ExecutionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    /// Set when the early-finish breaker ended the request after this turn.
    #[serde(default)]
    pub stalled: bool,
    /// The executed action was issued by the controller, not the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Turn(TurnRecord),
    End { timestamp: String, reason: String },
}

pub struct SessionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SessionLog {
    /// Open a fresh `session_<YYYYmmdd_HHMMSS>.jsonl` in `state_dir`.
    ///
    /// A numeric suffix is added when a log with the same second already exists.
    pub fn create(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create directory {}", state_dir.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let mut suffix = 1u32;
        loop {
            let name = if suffix == 1 {
                format!("session_{stamp}.jsonl")
            } else {
                format!("session_{stamp}_{suffix}.jsonl")
            };
            let path = state_dir.join(name);
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => {
                    tracing::debug!(path = %path.display(), "session log created");
                    return Ok(Self {
                        path,
                        writer: BufWriter::new(file),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", path.display()));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize session record")?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .with_context(|| format!("append {}", self.path.display()))?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data())
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

/// Read every record back from a session log.
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(step: usize) -> TurnRecord {
        TurnRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            step,
            user_input: "make src".to_string(),
            plan: "CREATE_DIRECTORY::src\nFINISH::done".to_string(),
            comments: Vec::new(),
            executed: Some(Action::CreateDirectory {
                path: "src".to_string(),
            }),
            not_executed: vec![Action::Finish {
                message: "done".to_string(),
            }],
            issues: Vec::new(),
            result: ExecutionResult::success("Created directory src"),
            credential_id: Some("primary".to_string()),
            stalled: false,
            synthesized: false,
        }
    }

    #[test]
    fn log_name_follows_the_timestamp_pattern() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = SessionLog::create(temp.path()).expect("create");
        let name = log
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("session_"));
        assert!(name.ends_with(".jsonl"));
        let stamp = &name["session_".len().."session_".len() + 15];
        assert_eq!(stamp.as_bytes()[8], b'_');
        assert!(stamp.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn two_logs_in_the_same_second_do_not_collide() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = SessionLog::create(temp.path()).expect("first");
        let second = SessionLog::create(temp.path()).expect("second");
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn appended_records_are_visible_without_dropping_the_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut log = SessionLog::create(temp.path()).expect("create");
        log.append(&LogRecord::Turn(turn(1))).expect("append");
        log.append(&LogRecord::End {
            timestamp: chrono::Utc::now().to_rfc3339(),
            reason: "finished".to_string(),
        })
        .expect("append end");

        let records = read_log(log.path()).expect("read");
        assert_eq!(records.len(), 2);
        match &records[0] {
            LogRecord::Turn(record) => {
                assert_eq!(record.step, 1);
                assert_eq!(record.not_executed.len(), 1);
            }
            other => panic!("expected turn, got {other:?}"),
        }
        assert!(matches!(&records[1], LogRecord::End { reason, .. } if reason == "finished"));
    }
}
