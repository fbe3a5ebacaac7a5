use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AgentError;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingInput,
    Inferring,
    Executing,
    Recording,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "Idle",
            SessionState::AwaitingInput => "AwaitingInput",
            SessionState::Inferring => "Inferring",
            SessionState::Executing => "Executing",
            SessionState::Recording => "Recording",
            SessionState::Terminated => "Terminated",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session opened.
    Start,
    /// User input accepted.
    Submit,
    /// The plan yielded an action to execute.
    PlanReady,
    /// The plan yielded nothing executable.
    NoAction,
    /// The action finished (successfully or not).
    Executed,
    /// Another step for the same request.
    Continue,
    /// Request done without finishing the session; wait for input.
    Yield,
    /// A `Finish` action was recorded.
    Finish,
    /// User asked to exit.
    Exit,
    /// Session-fatal inference failure.
    Fail,
    /// Reopen a session that ended with `Finish`.
    Resume,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEvent::Start => "Start",
            SessionEvent::Submit => "Submit",
            SessionEvent::PlanReady => "PlanReady",
            SessionEvent::NoAction => "NoAction",
            SessionEvent::Executed => "Executed",
            SessionEvent::Continue => "Continue",
            SessionEvent::Yield => "Yield",
            SessionEvent::Finish => "Finish",
            SessionEvent::Exit => "Exit",
            SessionEvent::Fail => "Fail",
            SessionEvent::Resume => "Resume",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
    history: Vec<(SessionState, SessionEvent, SessionState)>,
}

impl SessionStateMachine {
    /// Create a new state machine starting in `Idle`.
    pub fn new() -> Self {
        Self {
            current: SessionState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    /// Return the full transition history.
    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        &self.history
    }

    pub fn is_terminated(&self) -> bool {
        self.current == SessionState::Terminated
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Idle          + Start     -> AwaitingInput
    /// - Idle          + Exit      -> Terminated
    /// - AwaitingInput + Submit    -> Inferring
    /// - AwaitingInput + Exit      -> Terminated
    /// - Inferring     + PlanReady -> Executing
    /// - Inferring     + NoAction  -> Recording
    /// - Inferring     + Fail      -> Terminated
    /// - Executing     + Executed  -> Recording
    /// - Executing     + Fail      -> Terminated
    /// - Recording     + Continue  -> Inferring
    /// - Recording     + Yield     -> AwaitingInput
    /// - Recording     + Finish    -> Terminated
    /// - Terminated    + Resume    -> AwaitingInput
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, AgentError> {
        let next = match (self.current, event) {
            (SessionState::Idle, SessionEvent::Start) => SessionState::AwaitingInput,
            (SessionState::Idle, SessionEvent::Exit) => SessionState::Terminated,
            (SessionState::AwaitingInput, SessionEvent::Submit) => SessionState::Inferring,
            (SessionState::AwaitingInput, SessionEvent::Exit) => SessionState::Terminated,
            (SessionState::Inferring, SessionEvent::PlanReady) => SessionState::Executing,
            (SessionState::Inferring, SessionEvent::NoAction) => SessionState::Recording,
            (SessionState::Inferring, SessionEvent::Fail) => SessionState::Terminated,
            (SessionState::Executing, SessionEvent::Executed) => SessionState::Recording,
            (SessionState::Executing, SessionEvent::Fail) => SessionState::Terminated,
            (SessionState::Recording, SessionEvent::Continue) => SessionState::Inferring,
            (SessionState::Recording, SessionEvent::Yield) => SessionState::AwaitingInput,
            (SessionState::Recording, SessionEvent::Finish) => SessionState::Terminated,
            (SessionState::Terminated, SessionEvent::Resume) => SessionState::AwaitingInput,
            _ => {
                return Err(AgentError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "session state transition");
        Ok(next)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
