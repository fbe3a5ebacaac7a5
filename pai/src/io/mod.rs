//! Side-effecting adapters: filesystem, processes, credentials, the model.

pub mod audit;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod gateway;
pub mod inference;
pub mod platform;
pub mod process;
pub mod prompt;
pub mod session_log;
pub mod shell;
pub mod walk;
pub mod workspace;
