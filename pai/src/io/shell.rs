//! Shell execution sandbox: network gate, workspace cwd, deadline, stdin injection.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::core::action::ExecutionResult;
use crate::core::network;
use crate::error::AgentError;
use crate::io::platform::ShellKind;
use crate::io::process::{CommandOutput, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct ShellSandbox {
    root: PathBuf,
    shell: ShellKind,
    timeout: Duration,
    output_limit_bytes: usize,
    allow_network: bool,
    verbose: bool,
}

impl ShellSandbox {
    pub fn new(root: &Path, shell: ShellKind, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            shell,
            timeout,
            output_limit_bytes,
            allow_network: false,
            verbose: false,
        }
    }

    pub fn allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `command` from the workspace root, optionally feeding `stdin`.
    ///
    /// A timeout is not an `Err`: the partial output comes back as a failed
    /// result classed `ShellTimeout`, so nothing captured is lost.
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs(), with_stdin = stdin.is_some()))]
    pub fn run(&self, command: &str, stdin: Option<&str>) -> Result<ExecutionResult, AgentError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(AgentError::Parse("empty command".to_string()));
        }
        if !self.allow_network
            && let Some(indicator) = network::scan(command)
        {
            return Err(AgentError::NetworkBlocked { indicator });
        }

        if self.verbose {
            info!(command, shell = self.shell.name(), "executing");
        } else {
            debug!(command, "executing");
        }

        let mut cmd = self.shell.command(command);
        cmd.current_dir(&self.root);
        let output = run_command_with_timeout(
            cmd,
            stdin.map(str::as_bytes),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| AgentError::fs(&self.root, io::Error::other(format!("{err:#}"))))?;

        let report = format_output(&output);
        if output.timed_out {
            let err = AgentError::ShellTimeout {
                timeout: self.timeout,
            };
            return Ok(ExecutionResult::failure(format!(
                "{err}; process terminated, partial output follows"
            ))
            .with_error_class(err.class())
            .with_payload(report));
        }

        let result = match output.status.code() {
            Some(0) => ExecutionResult::success("Command exited with code 0"),
            Some(code) => ExecutionResult::failure(format!("Command exited with code {code}")),
            None => ExecutionResult::failure("Command was terminated by a signal"),
        };
        Ok(result.with_payload(report))
    }
}

/// `ExitCode:` line, then `STDOUT:`/`STDERR:` sections with truncation notices.
pub fn format_output(output: &CommandOutput) -> String {
    let code = match (output.timed_out, output.status.code()) {
        (true, _) => "timeout".to_string(),
        (false, Some(code)) => code.to_string(),
        (false, None) => "signal".to_string(),
    };
    let mut out = format!("ExitCode: {code}\n");
    out.push_str("STDOUT:\n");
    out.push_str(&output.stdout_text());
    out.push_str(&output.stdout_truncated_notice());
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("STDERR:\n");
    out.push_str(&output.stderr_text());
    out.push_str(&output.stderr_truncated_notice());
    out.trim_end().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sandbox(root: &Path, timeout: Duration) -> ShellSandbox {
        ShellSandbox::new(root, ShellKind::Bash, timeout, 10_000)
    }

    #[test]
    fn runs_in_workspace_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let result = sandbox(temp.path(), Duration::from_secs(20))
            .run("cat marker.txt", None)
            .expect("run");
        assert!(result.is_success());
        let payload = result.payload.expect("payload");
        assert!(payload.starts_with("ExitCode: 0\nSTDOUT:\n"));
        assert!(payload.contains("here"));
    }

    #[test]
    fn non_zero_exit_is_a_failure_with_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = sandbox(temp.path(), Duration::from_secs(20))
            .run("echo oops 1>&2; exit 4", None)
            .expect("run");
        assert!(!result.is_success());
        let payload = result.payload.expect("payload");
        assert!(payload.contains("ExitCode: 4"));
        assert!(payload.contains("oops"));
    }

    #[test]
    fn network_commands_are_blocked_unless_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocked = sandbox(temp.path(), Duration::from_secs(20)).run("curl https://example.com", None);
        assert!(matches!(blocked, Err(AgentError::NetworkBlocked { .. })));
    }

    #[test]
    fn stdin_payload_reaches_the_program() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = sandbox(temp.path(), Duration::from_secs(20))
            .run("read name; read age; echo \"$name:$age\"", Some("Alice\n42\n"))
            .expect("run");
        assert!(result.payload.expect("payload").contains("Alice:42"));
    }

    #[test]
    fn timeout_returns_partial_output_and_terminates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let result = sandbox(temp.path(), Duration::from_secs(5))
            .run("read name; echo \"hello $name\"; sleep 60; echo late", Some("Alice\n42\n"))
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(result.error.as_deref(), Some("ShellTimeout"));
        assert!(result.message.contains("timed out"));
        let payload = result.payload.expect("payload");
        assert!(payload.contains("hello Alice"));
        assert!(!payload.contains("late"));
    }
}
