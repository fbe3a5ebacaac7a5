//! Agent configuration stored under `.pai_history/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::history::EvictionPolicy;
use crate::core::plan::HARD_MAX_PLAN_LINES;
use crate::core::retry::RetryPolicy;

/// Workspace-scoped directory for config, session logs and the audit trail.
/// It is on the deny-list, so actions can never reach it.
pub const STATE_DIR: &str = ".pai_history";

/// Prefix for environment overrides (`PAI_SHELL_TIMEOUT_SECS`, ...).
pub const ENV_PREFIX: &str = "PAI_";

/// Agent configuration (TOML).
///
/// Missing fields take their defaults. Every field can be overridden from the
/// environment with `PAI_<FIELD>` in upper case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub shell_timeout_secs: u64,
    /// Permit commands that look like they reach the network.
    pub allow_network: bool,
    /// Total inference attempts per call before giving up.
    pub retry_max: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: bool,
    /// Plan lines considered per step, clamped to the hard cap.
    pub max_plan_lines: usize,
    /// Consecutive no-op steps before a `Finish` is synthesized.
    pub early_finish_threshold: usize,
    /// Turns kept verbatim in the prompt.
    pub history_window: usize,
    pub history_eviction: EvictionPolicy,
    pub max_steps_per_request: usize,
    /// Captured bytes kept per shell stream.
    pub output_limit_bytes: usize,
    /// MODIFY_FILE proposals touching more lines than this are rejected.
    pub modify_max_changed_lines: usize,
    /// Structural integrity bound on line-count change.
    pub modify_max_line_delta: usize,
    pub model: String,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 60,
            allow_network: false,
            retry_max: 20,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            backoff_jitter: true,
            max_plan_lines: 50,
            early_finish_threshold: 3,
            history_window: 10,
            history_eviction: EvictionPolicy::Summarize,
            max_steps_per_request: 25,
            output_limit_bytes: 100_000,
            modify_max_changed_lines: 50,
            modify_max_line_delta: 200,
            model: "gemini-2.5-flash".to_string(),
            verbose: false,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shell_timeout_secs == 0 {
            return Err(anyhow!("shell_timeout_secs must be > 0"));
        }
        if self.retry_max == 0 {
            return Err(anyhow!("retry_max must be > 0"));
        }
        if self.backoff_base_ms == 0 {
            return Err(anyhow!("backoff_base_ms must be > 0"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(anyhow!("backoff_cap_ms must be >= backoff_base_ms"));
        }
        if self.max_plan_lines == 0 || self.max_plan_lines > HARD_MAX_PLAN_LINES {
            return Err(anyhow!(
                "max_plan_lines must be between 1 and {HARD_MAX_PLAN_LINES}"
            ));
        }
        if self.early_finish_threshold == 0 {
            return Err(anyhow!("early_finish_threshold must be > 0"));
        }
        if self.history_window == 0 {
            return Err(anyhow!("history_window must be > 0"));
        }
        if self.max_steps_per_request == 0 {
            return Err(anyhow!("max_steps_per_request must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.modify_max_changed_lines == 0 {
            return Err(anyhow!("modify_max_changed_lines must be > 0"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        Ok(())
    }

    /// Apply `PAI_*` overrides from `vars`. Unknown `PAI_*` names are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            let parsed = || format!("{key}={value}");
            match field.to_ascii_lowercase().as_str() {
                "shell_timeout_secs" => self.shell_timeout_secs = value.parse().with_context(parsed)?,
                "allow_network" => self.allow_network = parse_bool(value).with_context(parsed)?,
                "retry_max" => self.retry_max = value.parse().with_context(parsed)?,
                "backoff_base_ms" => self.backoff_base_ms = value.parse().with_context(parsed)?,
                "backoff_cap_ms" => self.backoff_cap_ms = value.parse().with_context(parsed)?,
                "backoff_jitter" => self.backoff_jitter = parse_bool(value).with_context(parsed)?,
                "max_plan_lines" => self.max_plan_lines = value.parse().with_context(parsed)?,
                "early_finish_threshold" => {
                    self.early_finish_threshold = value.parse().with_context(parsed)?;
                }
                "history_window" => self.history_window = value.parse().with_context(parsed)?,
                "history_eviction" => {
                    self.history_eviction = match value.to_ascii_lowercase().as_str() {
                        "truncate" => EvictionPolicy::Truncate,
                        "summarize" => EvictionPolicy::Summarize,
                        other => bail!("{key}: unknown eviction policy {other:?}"),
                    };
                }
                "max_steps_per_request" => {
                    self.max_steps_per_request = value.parse().with_context(parsed)?;
                }
                "output_limit_bytes" => self.output_limit_bytes = value.parse().with_context(parsed)?,
                "modify_max_changed_lines" => {
                    self.modify_max_changed_lines = value.parse().with_context(parsed)?;
                }
                "modify_max_line_delta" => {
                    self.modify_max_line_delta = value.parse().with_context(parsed)?;
                }
                "model" => self.model = value.to_string(),
                "verbose" => self.verbose = parse_bool(value).with_context(parsed)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_cap_ms),
            jitter: self.backoff_jitter,
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got {other:?}")),
    }
}

/// `<workspace>/.pai_history/config.toml`
pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR).join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// File, then environment. The caller layers CLI flags on top and validates again.
pub fn resolve_config<I>(path: &Path, env: I) -> Result<AgentConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut cfg = load_config(path)?;
    cfg.apply_env(env)?;
    cfg.validate().context("invalid configuration after environment overrides")?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let cfg = AgentConfig {
            history_eviction: EvictionPolicy::Truncate,
            ..AgentConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "shell_timeout_secs = 5\nhistory_eviction = \"truncate\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.shell_timeout_secs, 5);
        assert_eq!(cfg.history_eviction, EvictionPolicy::Truncate);
        assert_eq!(cfg.retry_max, 20);
    }

    #[test]
    fn env_overrides_each_field_independently() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = resolve_config(
            &temp.path().join("missing.toml"),
            vars(&[
                ("PAI_ALLOW_NETWORK", "true"),
                ("PAI_RETRY_MAX", "3"),
                ("PAI_HISTORY_EVICTION", "truncate"),
                ("HOME", "/ignored"),
                ("PAI_UNKNOWN", "x"),
            ]),
        )
        .expect("resolve");
        assert!(cfg.allow_network);
        assert_eq!(cfg.retry_max, 3);
        assert_eq!(cfg.history_eviction, EvictionPolicy::Truncate);
        assert_eq!(cfg.shell_timeout_secs, 60);
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut cfg = AgentConfig::default();
        let err = cfg
            .apply_env(vars(&[("PAI_SHELL_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("PAI_SHELL_TIMEOUT_SECS"));
    }

    #[test]
    fn validate_rejects_plan_lines_above_hard_cap() {
        let cfg = AgentConfig {
            max_plan_lines: HARD_MAX_PLAN_LINES + 1,
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_policy_mirrors_backoff_fields() {
        let policy = AgentConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
