use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;

/// Main entry point for the CLI: parse arguments, initialize logging, and
/// build the action for the binary to execute.
///
/// # Errors
///
/// Returns an error if argument parsing, telemetry initialization, or
/// action dispatch fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity = matches
        .get_one::<u8>(commands::ARG_VERBOSITY)
        .copied()
        .unwrap_or(0);
    telemetry::init(verbosity)?;

    dispatch::handler(&matches)
}
