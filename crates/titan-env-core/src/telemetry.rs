//! Tracing setup for `titan-env` processes.
//!
//! Logs always go to stderr. Stdout is reserved for command output, so a
//! `--json` report can be piped straight into another tool.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging, as `--verbose` does.
pub const DEBUG_ENV: &str = "TITAN_DEBUG";

/// DEBUG when `verbose` is set or [`DEBUG_ENV`] is present, INFO otherwise.
pub fn default_level(verbose: bool) -> Level {
    if verbose || std::env::var_os(DEBUG_ENV).is_some() {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

/// Install the global subscriber once; later calls are ignored.
///
/// `RUST_LOG` wins over both `verbose` and [`DEBUG_ENV`]. With `json` every
/// event is one JSON object per line.
pub fn init_tracing(json: bool, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose).as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
