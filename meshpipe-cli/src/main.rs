//! `meshpipe` command-line entry point

mod cli;
mod telemetry;

use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    if let Err(err) = telemetry::init_logging(&cli.log_level, cli.log_format) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match cli::dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
