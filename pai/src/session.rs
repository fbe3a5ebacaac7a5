//! Session controller.
//!
//! A request runs as a bounded loop of steps. Each step renders the plan
//! prompt, asks the model for a plan, executes exactly the first valid action
//! and records the turn. The loop ends on `FINISH`, when the early-finish
//! breaker trips, at `max_steps_per_request`, or on a session-fatal error.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::action::{Action, ExecutionResult};
use crate::core::history::{HistoryEntry, HistoryWindow};
use crate::core::integrity::IntegrityRegistry;
use crate::core::plan::{Plan, PlanParser};
use crate::core::stall::StallDetector;
use crate::core::state::{SessionEvent, SessionState, SessionStateMachine};
use crate::error::AgentError;
use crate::io::audit::AuditTrail;
use crate::io::backend::ModelBackend;
use crate::io::config::{AgentConfig, STATE_DIR};
use crate::io::credentials::CredentialPool;
use crate::io::gateway::Gateway;
use crate::io::inference::{InferenceClient, Sleeper, strip_code_fences};
use crate::io::platform::EnvironmentSnapshot;
use crate::io::prompt::{PromptBuilder, PromptRules};
use crate::io::session_log::{LogRecord, SessionLog, TurnRecord};
use crate::io::shell::ShellSandbox;
use crate::io::workspace::{EditLimits, Workspace};

/// What one step did.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// 1-indexed within the request.
    pub step: usize,
    pub plan: Plan,
    pub executed: Option<Action>,
    /// Valid actions the model proposed after the executed one.
    pub not_executed: Vec<Action>,
    pub result: ExecutionResult,
    /// The early-finish breaker tripped on this step.
    pub stalled: bool,
}

/// Reason why `handle_request` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStop {
    /// The model emitted `FINISH`.
    Finished { message: String },
    /// Too many consecutive no-op steps; a `FINISH` was synthesized.
    Stalled { message: String },
    /// `max_steps_per_request` ran out; the session waits for more input.
    StepLimit { max_steps: usize },
    /// The user asked to leave.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub steps: usize,
    pub stop: RequestStop,
}

/// How the session reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Finished,
    UserExit,
    Fatal,
}

impl Termination {
    fn label(self) -> &'static str {
        match self {
            Termination::Finished => "finished",
            Termination::UserExit => "user_exit",
            Termination::Fatal => "fatal",
        }
    }
}

/// `exit` and `quit`, case-insensitive.
pub fn is_exit_command(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "exit" | "quit")
}

pub struct Session {
    config: AgentConfig,
    workspace: Workspace,
    shell: ShellSandbox,
    inference: InferenceClient,
    prompts: PromptBuilder,
    parser: PlanParser,
    history: HistoryWindow,
    stall: StallDetector,
    machine: SessionStateMachine,
    log: SessionLog,
    termination: Option<Termination>,
}

impl Session {
    /// Open a session on `root`.
    ///
    /// Creates `.pai_history/` (audit trail and this session's log) and moves
    /// the state machine to `AwaitingInput`.
    pub fn new(
        root: &Path,
        config: AgentConfig,
        backend: Box<dyn ModelBackend>,
        pool: CredentialPool,
        sleeper: Box<dyn Sleeper>,
    ) -> Result<Self> {
        config.validate()?;
        let gateway =
            Gateway::new(root).with_context(|| format!("open workspace {}", root.display()))?;
        let root = gateway.root().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        let audit = AuditTrail::open(&state_dir)?;
        let log = SessionLog::create(&state_dir)?;

        let snapshot = EnvironmentSnapshot::detect(&root);
        let shell = ShellSandbox::new(
            &root,
            snapshot.shell,
            config.shell_timeout(),
            config.output_limit_bytes,
        )
        .allow_network(config.allow_network)
        .verbose(config.verbose);
        let workspace = Workspace::new(
            gateway,
            IntegrityRegistry::with_defaults(config.modify_max_line_delta),
            audit,
            EditLimits {
                max_changed_lines: config.modify_max_changed_lines,
                ..EditLimits::default()
            },
        );
        let prompts = PromptBuilder::new(
            snapshot,
            PromptRules {
                allow_network: config.allow_network,
                timeout_secs: config.shell_timeout_secs,
            },
        );
        let inference = InferenceClient::new(backend, pool, config.retry_policy(), sleeper);

        let mut machine = SessionStateMachine::new();
        machine.apply(SessionEvent::Start)?;
        debug!(root = %root.display(), log = %log.path().display(), "session opened");

        Ok(Self {
            parser: PlanParser::new(config.max_plan_lines),
            history: HistoryWindow::new(config.history_window, config.history_eviction),
            stall: StallDetector::new(config.early_finish_threshold),
            config,
            workspace,
            shell,
            inference,
            prompts,
            machine,
            log,
            termination: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn root(&self) -> &Path {
        self.workspace.root()
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Credential id used for the latest model call.
    pub fn active_credential(&self) -> Option<&str> {
        self.inference.pool().active_id()
    }

    /// Drive one user request to completion.
    ///
    /// `exit`/`quit` terminate the session. A session that ended with `FINISH`
    /// is resumed with its history intact. Session-fatal failures
    /// (`InferenceFatal`, `CredentialExhausted`) come back as errors holding
    /// the `AgentError`; the session is then terminated.
    #[instrument(skip_all, fields(input_len = input.len()))]
    pub fn handle_request<F: FnMut(&StepReport)>(
        &mut self,
        input: &str,
        mut on_step: F,
    ) -> Result<RequestOutcome> {
        let input = input.trim();
        if is_exit_command(input) {
            self.terminate()?;
            return Ok(RequestOutcome {
                steps: 0,
                stop: RequestStop::Exited,
            });
        }
        if input.is_empty() {
            return Err(anyhow!("empty request"));
        }
        if self.termination == Some(Termination::Finished) {
            self.machine.apply(SessionEvent::Resume)?;
            self.termination = None;
            debug!("session resumed");
        }
        self.machine.apply(SessionEvent::Submit)?;
        self.stall.reset();

        let max_steps = self.config.max_steps_per_request;
        for step in 1..=max_steps {
            let report = self.run_step(input, step)?;
            on_step(&report);

            if let Some(Action::Finish { message }) = &report.executed {
                self.finish(Termination::Finished)?;
                return Ok(RequestOutcome {
                    steps: step,
                    stop: RequestStop::Finished {
                        message: message.clone(),
                    },
                });
            }
            if report.stalled {
                let message = format!(
                    "Stopped after {} steps without progress",
                    self.stall.consecutive()
                );
                warn!(step, consecutive = self.stall.consecutive(), "early finish");
                self.record_early_finish(input, step, &message);
                self.finish(Termination::Finished)?;
                return Ok(RequestOutcome {
                    steps: step,
                    stop: RequestStop::Stalled { message },
                });
            }
            if step < max_steps {
                self.machine.apply(SessionEvent::Continue)?;
            }
        }

        self.machine.apply(SessionEvent::Yield)?;
        warn!(max_steps, "step limit reached, waiting for input");
        Ok(RequestOutcome {
            steps: max_steps,
            stop: RequestStop::StepLimit { max_steps },
        })
    }

    /// One step: infer, execute the first valid action, record the turn.
    ///
    /// The session must be `Inferring`; it is left in `Recording`, or in
    /// `Terminated` when a session-fatal error is returned.
    #[instrument(skip_all, fields(step = step))]
    pub fn run_step(&mut self, input: &str, step: usize) -> Result<StepReport> {
        if self.machine.state() != SessionState::Inferring {
            return Err(anyhow!(
                "cannot run a step while the session is {}",
                self.machine.state()
            ));
        }

        let prompt = match self.prompts.plan_prompt(&self.history, input) {
            Ok(prompt) => prompt,
            Err(err) => {
                return Err(self.fail(AgentError::InferenceFatal(format!(
                    "render plan prompt: {err:#}"
                ))));
            }
        };
        let plan_text = match self.inference.complete(&prompt) {
            Ok(text) => text,
            Err(err) => return Err(self.fail(err)),
        };

        let (plan, parse_error) = match self.parser.parse(&plan_text) {
            Ok(plan) => (plan, None),
            Err(err) => (Plan::default(), Some(err)),
        };
        let issues = plan.issues();
        let mut actions = plan.actions().cloned();
        let executed = actions.next();
        let not_executed: Vec<Action> = actions.collect();
        if !not_executed.is_empty() {
            debug!(count = not_executed.len(), "proposed actions not executed");
        }

        let result = match &executed {
            Some(action) => {
                self.machine.apply(SessionEvent::PlanReady)?;
                let result = match self.execute(action, input) {
                    Ok(result) => result,
                    Err(err) => return Err(self.fail(err)),
                };
                self.machine.apply(SessionEvent::Executed)?;
                result
            }
            None => {
                self.machine.apply(SessionEvent::NoAction)?;
                match parse_error.as_ref().or(issues.first()) {
                    Some(err) => ExecutionResult::from_error(err),
                    None => ExecutionResult::failure("No valid action in plan")
                        .with_error_class("ParseError"),
                }
            }
        };

        let stalled = !executed.as_ref().is_some_and(Action::is_terminal)
            && self.stall.observe(executed.as_ref());

        self.history.push(HistoryEntry {
            user_input: input.to_string(),
            action: executed.as_ref().map(Action::to_wire),
            result: result.render(),
            succeeded: result.is_success(),
            not_executed: not_executed.iter().map(Action::to_wire).collect(),
        });
        let record = TurnRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            step,
            user_input: input.to_string(),
            plan: plan_text,
            comments: plan.comments().map(str::to_string).collect(),
            executed: executed.clone(),
            not_executed: not_executed.clone(),
            issues: issues.iter().map(ToString::to_string).collect(),
            result: result.clone(),
            credential_id: self.active_credential().map(str::to_string),
            stalled,
            synthesized: false,
        };
        if let Err(err) = self.log.append(&LogRecord::Turn(record)) {
            warn!(err = %err, "failed to append session record");
        }

        Ok(StepReport {
            step,
            plan,
            executed,
            not_executed,
            result,
            stalled,
        })
    }

    /// End the session and flush the log.
    ///
    /// A session already terminated (by `FINISH` or a fatal error) is only
    /// flushed.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.machine.is_terminated() {
            self.machine.apply(SessionEvent::Exit)?;
            self.termination = Some(Termination::UserExit);
            self.append_end(Termination::UserExit);
            info!("session ended by user");
        }
        self.log.flush()
    }

    /// Route one action to the engine that owns it.
    ///
    /// Only session-fatal errors come back as `Err`; everything else is
    /// folded into a failed result so the conversation can continue.
    fn execute(&mut self, action: &Action, input: &str) -> Result<ExecutionResult, AgentError> {
        debug!(tag = %action.tag(), "executing action");
        let outcome = match action {
            Action::CreateDirectory { path } => self.workspace.create_directory(path),
            Action::CreateFile { path } => self.workspace.create_file(path),
            Action::ReadFile { path } => self.workspace.read_file(path),
            Action::WriteFile { path, description } => {
                self.write_generated(path, description, input)
            }
            Action::ModifyFile { path, description } => {
                self.modify_generated(path, description, input, action.requests_empty_file())
            }
            Action::DeletePath { path } => self.workspace.delete_path(path),
            Action::MovePath {
                source,
                destination,
                overwrite,
            } => self.workspace.move_path(source, destination, *overwrite),
            Action::ShowTree { path } => self.workspace.show_tree(path),
            Action::ListPaths { path } => self.workspace.list_paths(path),
            Action::Execute { command } => self.shell.run(command, None),
            Action::ExecuteWithInput { command, stdin } => self.shell.run(command, Some(stdin)),
            Action::Finish { message } => Ok(ExecutionResult::success(message.clone())),
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(err) if err.is_session_fatal() => Err(err),
            Err(err) => {
                debug!(class = err.class(), err = %err, "action failed");
                Ok(ExecutionResult::from_error(&err))
            }
        }
    }

    fn write_generated(
        &mut self,
        path: &str,
        description: &str,
        input: &str,
    ) -> Result<ExecutionResult, AgentError> {
        // Reject bad paths before spending a model call on them.
        let target = self.workspace.gateway().validate(path)?;
        let prompt = self
            .prompts
            .write_prompt(&target.display(), description, Some(input))
            .map_err(prompt_error)?;
        let content = strip_code_fences(&self.inference.complete(&prompt)?);
        self.workspace.write_file(path, &content)
    }

    fn modify_generated(
        &mut self,
        path: &str,
        description: &str,
        input: &str,
        allow_empty: bool,
    ) -> Result<ExecutionResult, AgentError> {
        let (target, current) = self.workspace.read_text(path)?;
        let prompt = self
            .prompts
            .modify_prompt(&target.display(), description, &current, Some(input))
            .map_err(prompt_error)?;
        let proposal = strip_code_fences(&self.inference.complete(&prompt)?);
        self.workspace.modify_file(path, &proposal, allow_empty)
    }

    /// Record the `FINISH` issued on the model's behalf when the breaker trips.
    fn record_early_finish(&mut self, input: &str, step: usize, message: &str) {
        let action = Action::Finish {
            message: message.to_string(),
        };
        let result = ExecutionResult::success(message);
        self.history.push(HistoryEntry {
            user_input: input.to_string(),
            action: Some(action.to_wire()),
            result: result.render(),
            succeeded: true,
            not_executed: Vec::new(),
        });
        let record = TurnRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            step,
            user_input: input.to_string(),
            plan: String::new(),
            comments: Vec::new(),
            executed: Some(action),
            not_executed: Vec::new(),
            issues: Vec::new(),
            result,
            credential_id: None,
            stalled: true,
            synthesized: true,
        };
        if let Err(err) = self.log.append(&LogRecord::Turn(record)) {
            warn!(err = %err, "failed to append early finish record");
        }
    }

    fn finish(&mut self, how: Termination) -> Result<()> {
        self.machine.apply(SessionEvent::Finish)?;
        self.termination = Some(how);
        self.append_end(how);
        self.log.flush()
    }

    /// Terminate on a session-fatal error and hand the error back.
    fn fail(&mut self, err: AgentError) -> anyhow::Error {
        warn!(class = err.class(), err = %err, "session-fatal error");
        if let Err(transition) = self.machine.apply(SessionEvent::Fail) {
            warn!(err = %transition, "could not record failure transition");
        }
        self.termination = Some(Termination::Fatal);
        self.append_end(Termination::Fatal);
        anyhow::Error::new(err)
    }

    fn append_end(&mut self, how: Termination) {
        let record = LogRecord::End {
            timestamp: chrono::Utc::now().to_rfc3339(),
            reason: how.label().to_string(),
        };
        if let Err(err) = self.log.append(&record) {
            warn!(err = %err, "failed to append session end record");
        }
    }
}

fn prompt_error(err: anyhow::Error) -> AgentError {
    AgentError::Parse(format!("render prompt: {err:#}"))
}
