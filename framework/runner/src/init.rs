use crate::cli::FlowcheckCli;
use clap::Parser;

/// Initialise the CLI and logging for the Flowcheck runner.
pub fn init() -> FlowcheckCli {
    env_logger::init();

    FlowcheckCli::parse()
}
