//! Test-only doubles: a scripted model backend, a recording sleeper and a
//! throwaway workspace with a ready-to-drive session.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tempfile::TempDir;

use crate::io::backend::{BackendError, BackendErrorKind, ModelBackend};
use crate::io::config::AgentConfig;
use crate::io::credentials::{CredentialKey, CredentialPool};
use crate::io::inference::Sleeper;
use crate::session::Session;

#[derive(Default)]
struct Script {
    queue: VecDeque<Result<String, BackendError>>,
    repeat: Option<Result<String, BackendError>>,
    prompts: Vec<String>,
    key_ids: Vec<String>,
}

/// Backend that replays a fixed list of responses and records every call.
///
/// Clones share state, so a test can keep a handle after boxing one into a
/// client. Once the queue runs dry, calls fail as `Malformed`.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Rc<RefCell<Script>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Result<String, BackendError>>) -> Self {
        Self {
            script: Rc::new(RefCell::new(Script {
                queue: responses.into(),
                ..Script::default()
            })),
        }
    }

    /// Successful responses, in order.
    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok((*t).to_string())).collect())
    }

    /// Return `response` on every call.
    pub fn repeating(response: Result<String, BackendError>) -> Self {
        Self {
            script: Rc::new(RefCell::new(Script {
                repeat: Some(response),
                ..Script::default()
            })),
        }
    }

    pub fn calls(&self) -> usize {
        self.script.borrow().prompts.len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.script.borrow().prompts.clone()
    }

    /// Credential id used for each call, in order.
    pub fn key_ids(&self) -> Vec<String> {
        self.script.borrow().key_ids.clone()
    }
}

impl ModelBackend for ScriptedBackend {
    fn send(&self, prompt: &str, credential: &CredentialKey) -> Result<String, BackendError> {
        let mut script = self.script.borrow_mut();
        script.prompts.push(prompt.to_string());
        script.key_ids.push(credential.id.clone());
        if let Some(next) = script.queue.pop_front() {
            return next;
        }
        match &script.repeat {
            Some(response) => response.clone(),
            None => Err(BackendError::new(
                BackendErrorKind::Malformed,
                "scripted backend has no responses left",
            )),
        }
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    delays: Rc<RefCell<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.borrow_mut().push(duration);
    }
}

/// Pool with one enabled key per id, in order.
pub fn key_pool(ids: &[&str]) -> CredentialPool {
    let mut pool = CredentialPool::new();
    for id in ids {
        pool.add(id, &format!("test-key-{id}-0123456789"), None)
            .expect("test key should be valid");
    }
    pool
}

/// Defaults with deterministic backoff and a generous shell timeout.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        shell_timeout_secs: 20,
        retry_max: 3,
        backoff_jitter: false,
        ..AgentConfig::default()
    }
}

/// Temporary workspace plus handles on the doubles driving its session.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub backend: ScriptedBackend,
    pub sleeper: RecordingSleeper,
}

impl TestWorkspace {
    pub fn new(backend: ScriptedBackend) -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            backend,
            sleeper: RecordingSleeper::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn session(&self) -> Session {
        self.session_with(test_config(), key_pool(&["primary"]))
    }

    pub fn session_with(&self, config: AgentConfig, pool: CredentialPool) -> Session {
        Session::new(
            self.root(),
            config,
            Box::new(self.backend.clone()),
            pool,
            Box::new(self.sleeper.clone()),
        )
        .expect("session should open")
    }
}
