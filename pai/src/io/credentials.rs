//! API key pool with round-robin rotation, persisted to an owner-only store.
//!
//! Secrets are wrapped in [`Secret`], whose `Debug` output is masked, so a key
//! cannot end up in logs or error messages by accident. The raw value is only
//! reachable through [`Secret::expose`] (used for the request header) and
//! [`CredentialPool::reveal`].

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AgentError;

/// Id given to a key migrated from the legacy single-key store.
pub const LEGACY_KEY_ID: &str = "primary";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `abcde...wxyz`; keys under ten characters show two on each side.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let (head, tail) = match chars.len() {
            0..=4 => return "****".to_string(),
            5..=9 => (2, 2),
            _ => (5, 4),
        };
        let start: String = chars[..head].iter().collect();
        let end: String = chars[chars.len() - tail..].iter().collect();
        format!("{start}...{end}")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.masked())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialKey {
    pub id: String,
    pub secret: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("key id must be non-empty and contain no whitespace: {0:?}")]
    InvalidId(String),
    #[error("key id already exists: {0}")]
    DuplicateId(String),
    #[error("no key with id: {0}")]
    UnknownId(String),
    #[error("secret must be non-empty")]
    EmptySecret,
}

/// One row of `pai config list`; never carries the raw secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSummary {
    pub id: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub masked: String,
    pub is_default: bool,
}

impl fmt::Display for CredentialSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_default { "*" } else { " " };
        let state = if self.enabled { "enabled" } else { "disabled" };
        write!(f, "{marker} {:<16} {:<8} {}", self.id, state, self.masked)?;
        if let Some(label) = &self.label {
            write!(f, "  ({label})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPool {
    keys: Vec<CredentialKey>,
    default_id: Option<String>,
    /// Id of the key handed out last.
    cursor: Option<String>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: &str,
        secret: &str,
        label: Option<String>,
    ) -> Result<(), CredentialError> {
        let id = id.trim();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(CredentialError::InvalidId(id.to_string()));
        }
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        if self.keys.iter().any(|k| k.id == id) {
            return Err(CredentialError::DuplicateId(id.to_string()));
        }
        self.keys.push(CredentialKey {
            id: id.to_string(),
            secret: Secret::new(secret),
            label,
            enabled: true,
        });
        if self.default_id.is_none() {
            self.default_id = Some(id.to_string());
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<(), CredentialError> {
        let idx = self.index_of(id)?;
        self.keys.remove(idx);
        if self.default_id.as_deref() == Some(id) {
            self.default_id = self.keys.first().map(|k| k.id.clone());
        }
        Ok(())
    }

    pub fn enable(&mut self, id: &str) -> Result<(), CredentialError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&mut self, id: &str) -> Result<(), CredentialError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), CredentialError> {
        let idx = self.index_of(id)?;
        self.keys[idx].enabled = enabled;
        Ok(())
    }

    pub fn set_default(&mut self, id: &str) -> Result<(), CredentialError> {
        self.index_of(id)?;
        self.default_id = Some(id.to_string());
        Ok(())
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.keys.iter().filter(|k| k.enabled).count()
    }

    pub fn list(&self) -> Vec<CredentialSummary> {
        self.keys
            .iter()
            .map(|k| CredentialSummary {
                id: k.id.clone(),
                label: k.label.clone(),
                enabled: k.enabled,
                masked: k.secret.masked(),
                is_default: self.default_id.as_deref() == Some(k.id.as_str()),
            })
            .collect()
    }

    /// Raw secret, for an explicit reveal request only.
    pub fn reveal(&self, id: &str) -> Result<&str, CredentialError> {
        let idx = self.index_of(id)?;
        Ok(self.keys[idx].secret.expose())
    }

    /// Advance the rotation and return the next enabled key.
    ///
    /// Keys are visited in stable insertion order, starting at the default key
    /// on the first call. Every enabled key is returned once before any repeats.
    pub fn next(&mut self) -> Result<CredentialKey, AgentError> {
        if self.keys.is_empty() {
            return Err(AgentError::CredentialExhausted);
        }
        let start = match self.cursor.as_deref().and_then(|id| self.position(id)) {
            Some(idx) => idx + 1,
            None => self
                .default_id
                .as_deref()
                .and_then(|id| self.position(id))
                .unwrap_or(0),
        };
        let n = self.keys.len();
        let key = (0..n)
            .map(|offset| &self.keys[(start + offset) % n])
            .find(|k| k.enabled)
            .cloned()
            .ok_or(AgentError::CredentialExhausted)?;
        debug!(key_id = %key.id, "credential rotated");
        self.cursor = Some(key.id.clone());
        Ok(key)
    }

    /// Id of the key handed out last.
    pub fn active_id(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// The key handed out last, if it is still enabled; otherwise rotate.
    pub fn current(&mut self) -> Result<CredentialKey, AgentError> {
        if let Some(id) = self.cursor.as_deref()
            && let Some(key) = self.keys.iter().find(|k| k.id == id && k.enabled)
        {
            return Ok(key.clone());
        }
        self.next()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.keys.iter().position(|k| k.id == id)
    }

    fn index_of(&self, id: &str) -> Result<usize, CredentialError> {
        self.position(id)
            .ok_or_else(|| CredentialError::UnknownId(id.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(default)]
    keys: Vec<CredentialKey>,
}

/// On-disk credential store (JSON, owner-only permissions on unix).
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// `$XDG_CONFIG_HOME/pai-code/credentials.json` (platform config dir elsewhere).
    pub fn default_location() -> Result<Self> {
        let base = dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
        Ok(Self::new(&base.join("pai-code").join("credentials.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn legacy_path(&self) -> PathBuf {
        self.path.with_file_name("credentials")
    }

    /// Load the pool. A missing store is an empty pool; a legacy plaintext
    /// single-key store is migrated to id `primary` and rewritten.
    pub fn load(&self) -> Result<CredentialPool> {
        if self.path.exists() {
            let contents = fs::read_to_string(&self.path)
                .with_context(|| format!("read {}", self.path.display()))?;
            return match serde_json::from_str::<StoreFile>(&contents) {
                Ok(file) => Ok(pool_from_file(file)),
                Err(err) => match legacy_secret(&contents) {
                    Some(secret) => self.migrate(secret),
                    None => Err(err).with_context(|| format!("parse {}", self.path.display())),
                },
            };
        }
        let legacy = self.legacy_path();
        if legacy.is_file() {
            let contents =
                fs::read_to_string(&legacy).with_context(|| format!("read {}", legacy.display()))?;
            if let Some(secret) = legacy_secret(&contents) {
                return self.migrate(secret);
            }
        }
        Ok(CredentialPool::new())
    }

    fn migrate(&self, secret: &str) -> Result<CredentialPool> {
        let mut pool = CredentialPool::new();
        pool.add(LEGACY_KEY_ID, secret, Some("migrated".to_string()))?;
        self.save(&pool)?;
        warn!(path = %self.path.display(), "migrated legacy credential store");
        Ok(pool)
    }

    /// Atomic write with directory mode 0700 and file mode 0600.
    pub fn save(&self, pool: &CredentialPool) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("credential path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
        restrict(parent, 0o700)?;

        let file = StoreFile {
            version: 1,
            default: pool.default_id.clone(),
            keys: pool.keys.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize credential store")?;
        buf.push('\n');

        let tmp_path = self.path.with_extension("json.tmp");
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut tmp = options
            .open(&tmp_path)
            .with_context(|| format!("open {}", tmp_path.display()))?;
        tmp.write_all(buf.as_bytes())
            .with_context(|| format!("write {}", tmp_path.display()))?;
        drop(tmp);
        restrict(&tmp_path, 0o600)?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

fn pool_from_file(file: StoreFile) -> CredentialPool {
    let default_id = file
        .default
        .filter(|id| file.keys.iter().any(|k| &k.id == id))
        .or_else(|| file.keys.first().map(|k| k.id.clone()));
    CredentialPool {
        keys: file.keys,
        default_id,
        cursor: None,
    }
}

/// A legacy store is a single bare token.
fn legacy_secret(contents: &str) -> Option<&str> {
    let trimmed = contents.trim();
    (!trimmed.is_empty() && !trimmed.starts_with('{') && !trimmed.chars().any(char::is_whitespace))
        .then_some(trimmed)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(ids: &[&str]) -> CredentialPool {
        let mut pool = CredentialPool::new();
        for id in ids {
            pool.add(id, &format!("secret-{id}-0123456789"), None).expect("add");
        }
        pool
    }

    fn ids(pool: &mut CredentialPool, n: usize) -> Vec<String> {
        (0..n).map(|_| pool.next().expect("next").id).collect()
    }

    #[test]
    fn rotation_visits_each_enabled_key_once_before_repeating() {
        let mut pool = pool(&["a", "b", "c"]);
        assert_eq!(ids(&mut pool, 6), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn disabling_removes_key_from_the_very_next_rotation() {
        let mut pool = pool(&["a", "b", "c"]);
        assert_eq!(pool.next().expect("next").id, "a");
        pool.disable("b").expect("disable");
        assert_eq!(ids(&mut pool, 3), vec!["c", "a", "c"]);
        pool.enable("b").expect("enable");
        assert_eq!(ids(&mut pool, 3), vec!["a", "b", "c"]);
    }

    #[test]
    fn rotation_starts_at_default_key() {
        let mut pool = pool(&["a", "b", "c"]);
        pool.set_default("b").expect("default");
        assert_eq!(ids(&mut pool, 3), vec!["b", "c", "a"]);
    }

    #[test]
    fn all_disabled_is_exhausted() {
        let mut pool = pool(&["a", "b"]);
        pool.disable("a").expect("disable");
        pool.disable("b").expect("disable");
        assert!(matches!(pool.next(), Err(AgentError::CredentialExhausted)));
        assert!(matches!(CredentialPool::new().next(), Err(AgentError::CredentialExhausted)));
    }

    #[test]
    fn current_sticks_until_the_key_is_disabled() {
        let mut pool = pool(&["a", "b"]);
        pool.next().expect("next");
        assert_eq!(pool.current().expect("current").id, "a");
        pool.disable("a").expect("disable");
        assert_eq!(pool.current().expect("current").id, "b");
    }

    #[test]
    fn ids_are_validated() {
        let mut pool = pool(&["a"]);
        assert!(matches!(pool.add("has space", "x", None), Err(CredentialError::InvalidId(_))));
        assert!(matches!(pool.add("", "x", None), Err(CredentialError::InvalidId(_))));
        assert!(matches!(pool.add("a", "x", None), Err(CredentialError::DuplicateId(_))));
        assert!(matches!(pool.add("b", "  ", None), Err(CredentialError::EmptySecret)));
        assert!(matches!(pool.remove("zzz"), Err(CredentialError::UnknownId(_))));
    }

    #[test]
    fn removing_default_promotes_first_remaining() {
        let mut pool = pool(&["a", "b"]);
        pool.remove("a").expect("remove");
        assert_eq!(pool.default_id(), Some("b"));
    }

    #[test]
    fn secrets_are_masked_everywhere_but_reveal() {
        let secret = Secret::new("AIzaSyExample1234wxyz");
        assert_eq!(secret.masked(), "AIzaS...wxyz");
        assert_eq!(Secret::new("abcdefg").masked(), "ab...fg");
        assert_eq!(Secret::new("abc").masked(), "****");
        assert!(!format!("{secret:?}").contains("Example"));

        let mut pool = CredentialPool::new();
        pool.add("k", "AIzaSyExample1234wxyz", None).expect("add");
        let listed = pool.list()[0].to_string();
        assert!(listed.contains("AIzaS...wxyz"));
        assert!(!listed.contains("Example"));
        assert_eq!(pool.reveal("k").expect("reveal"), "AIzaSyExample1234wxyz");
    }

    #[test]
    fn store_round_trips_with_owner_only_permissions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(&temp.path().join("pai-code/credentials.json"));
        let mut original = pool(&["a", "b"]);
        original.disable("b").expect("disable");
        original.set_default("b").expect("default");
        store.save(&original).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.list(), original.list());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(store.path()).expect("meta").permissions().mode();
            let dir_mode = fs::metadata(temp.path().join("pai-code"))
                .expect("meta")
                .permissions()
                .mode();
            assert_eq!(file_mode & 0o777, 0o600);
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[test]
    fn missing_store_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::new(&temp.path().join("credentials.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn legacy_plaintext_store_migrates_to_primary() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("credentials"), "AIzaLegacyKey9876\n").expect("write");
        let store = CredentialStore::new(&temp.path().join("credentials.json"));
        let pool = store.load().expect("load");
        assert_eq!(pool.default_id(), Some(LEGACY_KEY_ID));
        assert_eq!(pool.reveal(LEGACY_KEY_ID).expect("reveal"), "AIzaLegacyKey9876");
        assert!(store.path().is_file());
    }
}
