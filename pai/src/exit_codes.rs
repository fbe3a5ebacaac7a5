//! Stable exit codes for `pai` commands.

/// Command succeeded, or the session ended normally.
pub const OK: i32 = 0;
/// Invalid arguments, configuration or credential store, or other errors.
pub const INVALID: i32 = 1;
/// The session ended on an unrecoverable inference or credential failure.
pub const FATAL: i32 = 2;
