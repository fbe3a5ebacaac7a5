//! Bounded conversation window fed into every plan prompt.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Longest result text kept per entry when rendering.
const MAX_RESULT_CHARS: usize = 4_000;
/// Longest digest of evicted entries kept under the summarize policy.
const MAX_SUMMARY_LINES: usize = 50;

/// What happens to entries pushed out of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evicted entries are dropped.
    Truncate,
    /// Evicted entries are kept as one-line digests.
    #[default]
    Summarize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub user_input: String,
    /// Wire form of the executed action, if any.
    pub action: Option<String>,
    pub result: String,
    pub succeeded: bool,
    /// Valid actions the model proposed after the executed one.
    pub not_executed: Vec<String>,
}

impl HistoryEntry {
    fn render(&self) -> String {
        let mut out = format!("User: {}\n", self.user_input);
        match &self.action {
            Some(action) => out.push_str(&format!("Executed: {action}\n")),
            None => out.push_str("Executed: (no valid action)\n"),
        }
        if !self.not_executed.is_empty() {
            out.push_str(&format!(
                "Proposed but not executed: {}\n",
                self.not_executed.join(" | ")
            ));
        }
        out.push_str("Result: ");
        out.push_str(&clip(&self.result, MAX_RESULT_CHARS));
        out.push('\n');
        out
    }

    fn digest(&self) -> String {
        let status = if self.succeeded { "ok" } else { "failed" };
        let action = self.action.as_deref().unwrap_or("(no action)");
        format!("- {} -> {status}", clip(action, 160))
    }
}

#[derive(Debug, Clone)]
pub struct HistoryWindow {
    capacity: usize,
    policy: EvictionPolicy,
    entries: VecDeque<HistoryEntry>,
    summary: VecDeque<String>,
    evicted: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            entries: VecDeque::new(),
            summary: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            let Some(old) = self.entries.pop_front() else {
                break;
            };
            self.evicted += 1;
            if self.policy == EvictionPolicy::Summarize {
                self.summary.push_back(old.digest());
                if self.summary.len() > MAX_SUMMARY_LINES {
                    self.summary.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries pushed out of the window so far.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.summary.is_empty() {
            out.push_str(&format!(
                "Earlier steps ({} evicted, summarized):\n",
                self.evicted
            ));
            for line in &self.summary {
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        } else if self.evicted > 0 {
            out.push_str(&format!("({} earlier steps omitted)\n\n", self.evicted));
        }
        for entry in &self.entries {
            out.push_str(&entry.render());
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}… [clipped]", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry {
            user_input: "build it".to_string(),
            action: Some(format!("CREATE_FILE::f{n}.txt")),
            result: format!("created f{n}.txt"),
            succeeded: true,
            not_executed: Vec::new(),
        }
    }

    #[test]
    fn window_keeps_only_the_newest_entries() {
        let mut window = HistoryWindow::new(2, EvictionPolicy::Truncate);
        for n in 0..5 {
            window.push(entry(n));
        }
        assert_eq!(window.len(), 2);
        assert_eq!(window.evicted(), 3);
        let rendered = window.render();
        assert!(rendered.contains("f4.txt"));
        assert!(rendered.contains("f3.txt"));
        assert!(!rendered.contains("f2.txt"));
        assert!(rendered.contains("3 earlier steps omitted"));
    }

    #[test]
    fn summarize_policy_keeps_digests_of_evicted_entries() {
        let mut window = HistoryWindow::new(1, EvictionPolicy::Summarize);
        window.push(entry(0));
        window.push(entry(1));
        let rendered = window.render();
        assert!(rendered.contains("- CREATE_FILE::f0.txt -> ok"));
        assert!(rendered.contains("Executed: CREATE_FILE::f1.txt"));
    }

    #[test]
    fn proposed_but_not_executed_actions_are_rendered() {
        let mut window = HistoryWindow::new(3, EvictionPolicy::Truncate);
        let mut e = entry(0);
        e.not_executed = vec!["CREATE_FILE::later.txt".to_string()];
        window.push(e);
        assert!(window
            .render()
            .contains("Proposed but not executed: CREATE_FILE::later.txt"));
    }

    #[test]
    fn long_results_are_clipped() {
        let mut window = HistoryWindow::new(1, EvictionPolicy::Truncate);
        let mut e = entry(0);
        e.result = "x".repeat(MAX_RESULT_CHARS + 10);
        window.push(e);
        assert!(window.render().contains("[clipped]"));
    }
}
