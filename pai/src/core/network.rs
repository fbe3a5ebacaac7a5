//! Static scan of shell commands for network access.

use std::sync::LazyLock;

use regex::Regex;

static NETWORK_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:curl|wget|ssh|scp|rsync|sftp|ftp|telnet|netcat|ncat|nc)\b",
        r"(?i)\bgit\s+(?:clone|pull|push|fetch)\b",
        r"(?i)\bpip3?\s+install\b",
        r"(?i)\bnpm\s+(?:install|i|add)\b",
        r"(?i)\byarn\s+add\b",
        r"(?i)\bpnpm\s+(?:add|install)\b",
        r"(?i)\bcargo\s+install\b",
        r"(?i)\bapt(?:-get)?\s+\S+",
        r"(?i)\bbrew\s+install\b",
        r"(?i)\bgo\s+get\b",
        r"(?i)\b(?:Invoke-WebRequest|iwr)\b",
        r"(?i)\bhttps?://",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("network indicator regex"))
    .collect()
});

/// Returns the first network indicator found in `command`, if any.
pub fn scan(command: &str) -> Option<String> {
    NETWORK_INDICATORS
        .iter()
        .filter_map(|re| re.find(command))
        .min_by_key(|m| m.start())
        .map(|m| m.as_str().trim().to_string())
}
