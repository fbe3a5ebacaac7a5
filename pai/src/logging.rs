//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr so
//!   it never mixes with agent output on stdout. Not persisted.
//!
//! - **Session log and audit trail (`io/session_log`, `io/audit`)**: product
//!   artifacts in `.pai_history/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset, or `pai=info` when
/// `verbose` is set and `RUST_LOG` is not.
///
/// # Example
/// ```bash
/// RUST_LOG=pai=debug pai auto
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,pai=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
