//! Deterministic, pure logic shared by the agent.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod action;
pub mod history;
pub mod integrity;
pub mod network;
pub mod patch;
pub mod path_policy;
pub mod plan;
pub mod retry;
pub mod stall;
pub mod state;
