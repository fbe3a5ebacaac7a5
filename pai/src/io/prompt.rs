//! Prompt builder for plan, write and modify requests.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::history::HistoryWindow;
use crate::core::path_policy::DEFAULT_DENY_LIST;
use crate::io::platform::EnvironmentSnapshot;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const WRITE_TEMPLATE: &str = include_str!("prompts/write.md");
const MODIFY_TEMPLATE: &str = include_str!("prompts/modify.md");

/// Settings that shape the rules section of the plan prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptRules {
    pub allow_network: bool,
    pub timeout_secs: u64,
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
    snapshot: EnvironmentSnapshot,
    rules: PromptRules,
}

impl PromptBuilder {
    pub fn new(snapshot: EnvironmentSnapshot, rules: PromptRules) -> Self {
        let mut env = Environment::new();
        env.add_template("plan.md", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("write.md", WRITE_TEMPLATE)
            .expect("write template should be valid");
        env.add_template("modify.md", MODIFY_TEMPLATE)
            .expect("modify template should be valid");
        Self {
            env,
            snapshot,
            rules,
        }
    }

    pub fn snapshot(&self) -> &EnvironmentSnapshot {
        &self.snapshot
    }

    /// Persona and rules, environment facts, the history window, then the request.
    pub fn plan_prompt(&self, history: &HistoryWindow, user_input: &str) -> Result<String> {
        let rendered_history = history.render();
        let template = self.env.get_template("plan.md")?;
        let rendered = template.render(context! {
            deny_list => DEFAULT_DENY_LIST.join(", "),
            allow_network => self.rules.allow_network,
            timeout_secs => self.rules.timeout_secs,
            environment => self.snapshot.describe(),
            history => (!rendered_history.trim().is_empty()).then_some(rendered_history.trim()),
            user_input => user_input.trim(),
        })?;
        debug!(bytes = rendered.len(), history_turns = history.len(), "plan prompt rendered");
        Ok(rendered)
    }

    pub fn write_prompt(&self, path: &str, description: &str, request: Option<&str>) -> Result<String> {
        let template = self.env.get_template("write.md")?;
        Ok(template.render(context! {
            path => path,
            description => description.trim(),
            request => request.map(str::trim).filter(|s| !s.is_empty()),
            environment => self.snapshot.describe(),
        })?)
    }

    pub fn modify_prompt(
        &self,
        path: &str,
        description: &str,
        content: &str,
        request: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("modify.md")?;
        Ok(template.render(context! {
            path => path,
            description => description.trim(),
            content => content.trim_end_matches('\n'),
            request => request.map(str::trim).filter(|s| !s.is_empty()),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::{EvictionPolicy, HistoryEntry};
    use std::path::Path;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(
            EnvironmentSnapshot::detect(Path::new("/work/proj")),
            PromptRules {
                allow_network: false,
                timeout_secs: 60,
            },
        )
    }

    #[test]
    #[cfg(unix)]
    fn plan_prompt_orders_persona_environment_history_request() {
        let mut history = HistoryWindow::new(5, EvictionPolicy::Truncate);
        history.push(HistoryEntry {
            user_input: "make a dir".to_string(),
            action: Some("CREATE_DIRECTORY::src".to_string()),
            result: "Success: Created directory src".to_string(),
            succeeded: true,
            not_executed: Vec::new(),
        });
        let prompt = builder().plan_prompt(&history, "add main.py").expect("render");

        let persona = prompt.find("You are Pai").expect("persona");
        let environment = prompt.find("Workspace root: /work/proj").expect("environment");
        let past = prompt.find("CREATE_DIRECTORY::src").expect("history");
        let request = prompt.rfind("add main.py").expect("request");
        assert!(persona < environment && environment < past && past < request);
        assert!(prompt.contains("blocked"));
        assert!(prompt.contains(".env"));
    }

    #[test]
    fn empty_history_section_is_omitted() {
        let history = HistoryWindow::new(5, EvictionPolicy::Truncate);
        let prompt = builder().plan_prompt(&history, "hello").expect("render");
        assert!(!prompt.contains("Conversation so far"));
    }

    #[test]
    fn modify_prompt_embeds_current_content() {
        let prompt = builder()
            .modify_prompt("app.py", "return 2", "def f():\n    return 1\n", None)
            .expect("render");
        assert!(prompt.contains("<<<FILE\ndef f():\n    return 1\nFILE>>>"));
        assert!(prompt.contains("--- a/app.py"));
    }

    #[test]
    fn write_prompt_names_path_and_description() {
        let prompt = builder()
            .write_prompt("main.py", "print hello", Some("build a greeter"))
            .expect("render");
        assert!(prompt.contains("`main.py`"));
        assert!(prompt.contains("Description: print hello"));
        assert!(prompt.contains("build a greeter"));
    }
}
