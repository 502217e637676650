use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{DEFAULT_BINARY, DEFAULT_HTTP_URL, DEFAULT_WORKSPACE};

#[derive(Debug, Parser)]
#[command(about, long_about = None, args_conflicts_with_subcommands = true)]
pub struct FlowcheckCli {
    #[command(subcommand)]
    pub command: Option<FlowcheckCommand>,

    /// The scenario to run, or `all` to run every registered scenario in order
    #[arg(default_value = "all")]
    pub scenario: String,

    /// Base URL of the HTTP gateway of the system under test
    #[arg(long, default_value = DEFAULT_HTTP_URL)]
    pub http_url: String,

    /// Path to the workspace directory shared with the system under test
    #[arg(long, default_value = DEFAULT_WORKSPACE)]
    pub workspace: PathBuf,

    /// Path to the CLI binary used by CLI scenarios
    #[arg(long, default_value = DEFAULT_BINARY)]
    pub binary: PathBuf,

    /// Config file passed to the CLI binary
    #[arg(long)]
    pub cli_config: Option<PathBuf>,

    /// Default timeout for each stage, in seconds
    #[arg(long, default_value_t = 90)]
    pub timeout_s: u64,

    /// Timeout for each setup and teardown hook, in seconds
    #[arg(long, default_value_t = 90)]
    pub setup_timeout_s: u64,

    /// Timeout for the whole run, in seconds
    #[arg(long, default_value_t = 600)]
    pub global_timeout_s: u64,

    /// Interval between convergence checks, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Use shorter timeouts, for running against a deterministic mock backend
    #[arg(long, default_value = "false")]
    pub fast_timeouts: bool,

    /// Write the run report as JSON to stdout instead of the text summary
    #[arg(long, default_value = "false")]
    pub json: bool,

    /// Do not show progress spinners on the CLI.
    ///
    /// This is recommended for CI/CD environments where the spinners aren't being looked at by anyone and are just adding noise to the logs.
    #[arg(long, default_value = "false")]
    pub no_progress: bool,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum FlowcheckCommand {
    /// List the registered scenarios and exit
    List,
}

impl FlowcheckCli {
    pub fn is_list(&self) -> bool {
        matches!(self.command, Some(FlowcheckCommand::List))
    }

    /// `None` when every scenario should run.
    pub fn selected_scenario(&self) -> Option<&str> {
        match self.scenario.as_str() {
            "all" => None,
            name => Some(name),
        }
    }

    pub fn show_progress(&self) -> bool {
        !self.no_progress && !self.json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_subcommand() {
        let cli = FlowcheckCli::parse_from(["flowcheck", "list"]);

        assert!(cli.is_list());
    }

    #[test]
    fn scenario_selection() {
        let all = FlowcheckCli::parse_from(["flowcheck"]);
        assert_eq!(None, all.selected_scenario());
        assert!(!all.is_list());

        let one = FlowcheckCli::parse_from(["flowcheck", "task-generation", "--json"]);
        assert_eq!(Some("task-generation"), one.selected_scenario());
        assert!(!one.show_progress());
    }
}
