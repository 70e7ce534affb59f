//! Centralized logging configuration for camsolve binaries and benchmarks
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to executables. This module provides the standard one.

use crate::error::{CamSolveError, CamSolveResult};
use tracing::Level;

/// Initialize the tracing subscriber with camsolve's standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// Per-iteration solver progress is logged at INFO, per-evaluation detail
/// at DEBUG and TRACE.
///
/// # Example
/// ```no_run
/// use camsolve::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Application started");
/// }
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin solve_synthetic
/// RUST_LOG=camsolve::measure=trace cargo run --bin solve_synthetic
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// A subscriber that is already installed (for example by a test harness)
/// is left in place.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
pub fn init_logger_with_level(default_level: Level) {
    if let Err(err) = try_init_logger(default_level) {
        eprintln!("{err}");
    }
}

/// Install the standard subscriber, reporting failure instead of panicking.
pub fn try_init_logger(default_level: Level) -> CamSolveResult<()> {
    use tracing_subscriber::fmt::time::SystemTime;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .map_err(|e| CamSolveError::Configuration(format!("Failed to install logger: {e}")))
}

/// Map a `-v` repetition count from a command line to a default level.
pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
