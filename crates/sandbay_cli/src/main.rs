//! sandbay CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or unknown session
//! - 3: Container runtime unavailable
//! - 4: Port conflict

use std::process::ExitCode;

use clap::Parser;
use sandbay_core::EngineError;
use sandbay_runner::RunnerError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands, Context};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const RUNTIME_UNAVAILABLE: u8 = 3;
    pub const PORT_CONFLICT: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let context = match Context::load(cli.config.as_deref(), cli.json) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(ExitCodes::INVALID_ARGS);
        }
    };

    let result = match cli.command {
        Commands::Open(args) => commands::open::execute(args, &context).await,
        Commands::Exec(args) => commands::exec::execute(args, &context).await,
        Commands::Web(args) => commands::web::execute(args, &context).await,
        Commands::Close(args) => commands::close::execute(args, &context).await,
        Commands::Validate(args) => commands::validate::execute(args, &context).await,
        Commands::Notify(args) => commands::notify::execute(args, &context).await,
        Commands::Logs(args) => commands::logs::execute(args, &context).await,
        Commands::Sessions(args) => commands::sessions::execute(args, &context).await,
        Commands::Run(args) => commands::run::execute(args, &context).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "sandbay=debug,info" } else { "sandbay=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (plain, structured) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
            None,
        )
    };

    let log_result = tracing_subscriber::registry()
        .with(plain)
        .with(structured)
        .with(filter)
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

/// Map an error to its exit code by the first engine or runner error in the chain
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(engine) = cause.downcast_ref::<EngineError>() {
            return match engine {
                _ if engine.is_runtime_unavailable() => ExitCodes::RUNTIME_UNAVAILABLE,
                _ if engine.is_port_conflict() => ExitCodes::PORT_CONFLICT,
                EngineError::SessionNotFound(_) | EngineError::InvalidConfig(_) => {
                    ExitCodes::INVALID_ARGS
                }
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
        if let Some(runner) = cause.downcast_ref::<RunnerError>() {
            return match runner {
                RunnerError::RuntimeUnavailable(_) => ExitCodes::RUNTIME_UNAVAILABLE,
                RunnerError::PortConflict(_) => ExitCodes::PORT_CONFLICT,
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
    }
    ExitCodes::GENERAL_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let missing = anyhow::Error::new(EngineError::SessionNotFound("t1".into()));
        assert_eq!(categorize_error(&missing), ExitCodes::INVALID_ARGS);

        let offline: Result<(), EngineError> =
            Err(RunnerError::RuntimeUnavailable("no docker".into()).into());
        let offline = offline.context("opening session").unwrap_err();
        assert_eq!(categorize_error(&offline), ExitCodes::RUNTIME_UNAVAILABLE);

        let busy = anyhow::Error::new(RunnerError::PortConflict(8080));
        assert_eq!(categorize_error(&busy), ExitCodes::PORT_CONFLICT);

        assert_eq!(
            categorize_error(&anyhow::anyhow!("boom")),
            ExitCodes::GENERAL_ERROR
        );
    }
}
