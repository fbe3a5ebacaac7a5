//! Resilient inference client: credential rotation, classified retries, backoff.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::core::retry::RetryPolicy;
use crate::error::AgentError;
use crate::io::backend::{BackendErrorKind, ModelBackend};
use crate::io::credentials::CredentialPool;

/// Time source for backoff delays.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub struct InferenceClient {
    backend: Box<dyn ModelBackend>,
    pool: CredentialPool,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl InferenceClient {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        pool: CredentialPool,
        policy: RetryPolicy,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        Self {
            backend,
            pool,
            policy,
            sleeper,
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut CredentialPool {
        &mut self.pool
    }

    /// Send `prompt` and return the raw response text.
    ///
    /// Each call starts on the next key in rotation. Transient failures are
    /// retried with backoff; a rate limit also moves to the next key. Fatal
    /// classes and retry exhaustion surface as `InferenceFatal`. With no
    /// enabled key the call fails with `CredentialExhausted` before any request.
    #[instrument(skip_all, fields(prompt_bytes = prompt.len(), max_attempts = self.policy.max_attempts))]
    pub fn complete(&mut self, prompt: &str) -> Result<String, AgentError> {
        let mut failures = 0u32;
        let mut rotate = true;
        loop {
            let key = if rotate {
                self.pool.next()?
            } else {
                self.pool.current()?
            };
            debug!(key_id = %key.id, attempt = failures + 1, "inference attempt");

            let err = match self.backend.send(prompt, &key) {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };
            if !err.kind.is_transient() {
                warn!(key_id = %key.id, kind = ?err.kind, "inference failed");
                return Err(AgentError::InferenceFatal(err.to_string()));
            }

            failures += 1;
            let transient = AgentError::InferenceTransient(err.to_string());
            if !self.policy.should_retry(failures) {
                warn!(failures, "retries exhausted");
                return Err(AgentError::InferenceFatal(format!(
                    "giving up after {failures} attempts; last error: {transient}"
                )));
            }
            rotate = err.kind == BackendErrorKind::RateLimited;
            let sample = if self.policy.jitter {
                rand::thread_rng().r#gen::<f64>()
            } else {
                0.0
            };
            let delay = self.policy.delay_for(failures, sample);
            warn!(
                key_id = %key.id,
                failures,
                delay_ms = delay.as_millis() as u64,
                rotate,
                err = %transient,
                "retrying inference"
            );
            self.sleeper.sleep(delay);
        }
    }
}

/// Strip a surrounding markdown code fence from model output.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
