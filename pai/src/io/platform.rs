//! Host facts used in prompts and to pick the shell launcher.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Powershell,
}

impl ShellKind {
    pub fn name(self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Powershell => "powershell",
        }
    }

    /// A command that runs `script` through this shell.
    pub fn command(self, script: &str) -> Command {
        match self {
            ShellKind::Bash => {
                let mut cmd = Command::new("bash");
                cmd.arg("-lc").arg(script);
                cmd
            }
            ShellKind::Powershell => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-NonInteractive", "-Command"])
                    .arg(script);
                cmd
            }
        }
    }
}

/// Environment snapshot rendered into every plan prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    /// `linux`, `darwin` or `windows`.
    pub os: String,
    pub shell: ShellKind,
    pub path_separator: char,
    pub workspace_root: PathBuf,
}

impl EnvironmentSnapshot {
    pub fn detect(workspace_root: &Path) -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        }
        .to_string();
        let shell = if cfg!(windows) {
            ShellKind::Powershell
        } else {
            ShellKind::Bash
        };
        Self {
            os,
            shell,
            path_separator: std::path::MAIN_SEPARATOR,
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "OS: {}\nShell: {}\nPath separator: {}\nWorkspace root: {}",
            self.os,
            self.shell.name(),
            self.path_separator,
            self.workspace_root.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn detects_linux_with_bash() {
        let env = EnvironmentSnapshot::detect(Path::new("/work"));
        assert_eq!(env.os, "linux");
        assert_eq!(env.shell, ShellKind::Bash);
        assert_eq!(env.path_separator, '/');
        assert!(env.describe().contains("Workspace root: /work"));
    }

    #[test]
    fn powershell_launcher_is_non_interactive() {
        let cmd = ShellKind::Powershell.command("Get-ChildItem");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-NoProfile", "-NonInteractive", "-Command", "Get-ChildItem"]
        );
    }
}
