//! Agent execution core for the `pai` terminal coding agent.
//!
//! A language model proposes plans as `TAG::arg` lines; the session executes
//! exactly one action per step inside a guarded workspace and feeds the result
//! back into the next prompt. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, lexical path policy,
//!   diffs, integrity checks, history, stall detection, the session state machine).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (filesystem, shell, credentials, the model
//!   backend). Isolated behind traits where tests need to swap them.
//!
//! [`session`] composes both into the turn loop the CLI drives.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
