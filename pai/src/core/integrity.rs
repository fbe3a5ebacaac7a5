//! Post-edit integrity checks, selected per file type.
//!
//! Every edit passes the structural check. Recognized file types add a
//! language check on top. Language checks only reject regressions: a file
//! that was already unparseable before the edit does not block the edit.

use std::collections::HashMap;
use std::path::Path;

pub trait IntegrityCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` carries a human-readable reason.
    fn check(&self, before: &str, after: &str) -> Result<(), String>;
}

/// Line-count delta bound and empty-file guard.
#[derive(Debug, Clone, Copy)]
pub struct StructuralCheck {
    pub max_line_delta: usize,
    pub allow_empty: bool,
}

impl StructuralCheck {
    pub fn new(max_line_delta: usize) -> Self {
        Self {
            max_line_delta,
            allow_empty: false,
        }
    }
}

impl IntegrityCheck for StructuralCheck {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn check(&self, before: &str, after: &str) -> Result<(), String> {
        if after.trim().is_empty() && !before.trim().is_empty() && !self.allow_empty {
            return Err("edit would truncate the file to zero length".to_string());
        }
        let before_lines = before.lines().count();
        let after_lines = after.lines().count();
        let delta = before_lines.abs_diff(after_lines);
        if delta > self.max_line_delta {
            return Err(format!(
                "line count changed by {delta} ({before_lines} -> {after_lines}), limit is {}",
                self.max_line_delta
            ));
        }
        Ok(())
    }
}

pub struct JsonCheck;

impl IntegrityCheck for JsonCheck {
    fn name(&self) -> &'static str {
        "json"
    }

    fn check(&self, before: &str, after: &str) -> Result<(), String> {
        let parses = |text: &str| serde_json::from_str::<serde_json::Value>(text);
        if before.trim().is_empty() || parses(before).is_ok() {
            parses(after).map_err(|err| format!("invalid JSON after edit: {err}"))?;
        }
        Ok(())
    }
}

pub struct TomlCheck;

impl IntegrityCheck for TomlCheck {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn check(&self, before: &str, after: &str) -> Result<(), String> {
        let parses = |text: &str| toml::from_str::<toml::Table>(text);
        if before.trim().is_empty() || parses(before).is_ok() {
            parses(after).map_err(|err| format!("invalid TOML after edit: {err}"))?;
        }
        Ok(())
    }
}

/// Bracket balance for source files, skipping strings and comments.
#[derive(Debug, Clone, Copy)]
pub struct DelimiterBalanceCheck {
    pub line_comment: &'static str,
    pub block_comment: Option<(&'static str, &'static str)>,
    pub quotes: &'static [char],
    pub triple_quotes: bool,
}

impl DelimiterBalanceCheck {
    pub const PYTHON: Self = Self {
        line_comment: "#",
        block_comment: None,
        quotes: &['"', '\''],
        triple_quotes: true,
    };

    /// C-family languages. Single quotes are left out so Rust lifetimes do not
    /// open a string.
    pub const C_LIKE: Self = Self {
        line_comment: "//",
        block_comment: Some(("/*", "*/")),
        quotes: &['"', '`'],
        triple_quotes: false,
    };

    pub fn imbalance(&self, text: &str) -> Option<String> {
        let bytes = text.as_bytes();
        let mut stack: Vec<(u8, usize)> = Vec::new();
        let mut line = 1usize;
        let mut i = 0usize;

        while i < bytes.len() {
            let rest = &text[i..];
            let b = bytes[i];

            if b == b'\n' {
                line += 1;
                i += 1;
                continue;
            }
            if rest.starts_with(self.line_comment) {
                i += rest.find('\n').unwrap_or(rest.len());
                continue;
            }
            if let Some((open, close)) = self.block_comment
                && rest.starts_with(open)
            {
                let body = &rest[open.len()..];
                let end = body.find(close).map(|p| p + open.len() + close.len());
                let consumed = end.unwrap_or(rest.len());
                line += rest[..consumed].matches('\n').count();
                i += consumed;
                continue;
            }
            if self.quotes.contains(&(b as char)) {
                let consumed = self.skip_string(rest);
                line += rest[..consumed].matches('\n').count();
                i += consumed;
                continue;
            }
            match b {
                b'(' | b'[' | b'{' => stack.push((b, line)),
                b')' | b']' | b'}' => {
                    let want = match b {
                        b')' => b'(',
                        b']' => b'[',
                        _ => b'{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == want => {}
                        Some((open, open_line)) => {
                            return Some(format!(
                                "'{}' on line {line} closes '{}' opened on line {open_line}",
                                b as char, open as char
                            ));
                        }
                        None => {
                            return Some(format!("unmatched '{}' on line {line}", b as char));
                        }
                    }
                }
                _ => {}
            }
            i += rest.chars().next().map(char::len_utf8).unwrap_or(1);
        }

        stack
            .last()
            .map(|(open, open_line)| format!("'{}' opened on line {open_line} is never closed", *open as char))
    }

    /// Length in bytes of the string literal at the start of `rest`.
    fn skip_string(&self, rest: &str) -> usize {
        let Some(quote) = rest.chars().next() else {
            return 0;
        };
        if self.triple_quotes {
            let triple = quote.to_string().repeat(3);
            if rest.starts_with(&triple) {
                return rest[3..]
                    .find(&triple)
                    .map(|p| p + 6)
                    .unwrap_or(rest.len());
            }
        }
        let mut escaped = false;
        for (idx, ch) in rest.char_indices().skip(1) {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '\n' if quote != '`' => return idx,
                c if c == quote => return idx + 1,
                _ => {}
            }
        }
        rest.len()
    }
}

impl IntegrityCheck for DelimiterBalanceCheck {
    fn name(&self) -> &'static str {
        "delimiters"
    }

    fn check(&self, before: &str, after: &str) -> Result<(), String> {
        if self.imbalance(before).is_some() {
            return Ok(());
        }
        match self.imbalance(after) {
            Some(reason) => Err(format!("unbalanced delimiters after edit: {reason}")),
            None => Ok(()),
        }
    }
}

/// Picks checks by file extension.
pub struct IntegrityRegistry {
    structural: StructuralCheck,
    by_extension: HashMap<String, Box<dyn IntegrityCheck>>,
}

impl IntegrityRegistry {
    pub fn new(structural: StructuralCheck) -> Self {
        Self {
            structural,
            by_extension: HashMap::new(),
        }
    }

    /// Registry with the built-in language checks.
    pub fn with_defaults(max_line_delta: usize) -> Self {
        let mut registry = Self::new(StructuralCheck::new(max_line_delta));
        registry.register(&["json"], || Box::new(JsonCheck));
        registry.register(&["toml"], || Box::new(TomlCheck));
        registry.register(&["py", "pyw"], || Box::new(DelimiterBalanceCheck::PYTHON));
        registry.register(
            &[
                "rs", "c", "h", "cc", "cpp", "hpp", "java", "js", "jsx", "ts", "tsx", "go", "cs",
                "kt", "swift", "dart",
            ],
            || Box::new(DelimiterBalanceCheck::C_LIKE),
        );
        registry
    }

    pub fn register(&mut self, extensions: &[&str], make: impl Fn() -> Box<dyn IntegrityCheck>) {
        for ext in extensions {
            self.by_extension.insert(ext.to_ascii_lowercase(), make());
        }
    }

    pub fn language_check(&self, path: &Path) -> Option<&dyn IntegrityCheck> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext).map(|check| check.as_ref())
    }

    /// Structural check, then the language check for `path` if there is one.
    pub fn verify(&self, path: &Path, before: &str, after: &str, allow_empty: bool) -> Result<(), String> {
        let structural = StructuralCheck {
            allow_empty,
            ..self.structural
        };
        structural.check(before, after)?;
        if let Some(check) = self.language_check(path) {
            check
                .check(before, after)
                .map_err(|reason| format!("{} check: {reason}", check.name()))?;
        }
        Ok(())
    }
}
