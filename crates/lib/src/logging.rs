//! Tracing setup and the top-level error-printing/exit-code contract.

use std::io::Write as _;

use owo_colors::OwoColorize;

/// Install a `tracing-subscriber` layer honoring `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run `f`, printing the full error chain and exiting 1 on failure.
///
/// Intended for use in `main`; this is the only place in the binary that
/// calls [`std::process::exit`].
pub fn run_main<F>(f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    if let Err(e) = f() {
        let mut stderr = anstream::stderr();
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
