use std::path::PathBuf;
use std::time::Duration;

use flowcheck_core::prelude::DEFAULT_POLL_INTERVAL;

use crate::cli::FlowcheckCli;

pub const DEFAULT_HTTP_URL: &str = "http://localhost:8180";
pub const DEFAULT_WORKSPACE: &str = "/workspace";
pub const DEFAULT_BINARY: &str = "./bin/semspec";
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Settings shared by every scenario in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Base URL of the HTTP gateway.
    pub http_base_url: String,
    /// Root of the shared filesystem workspace.
    pub workspace_path: PathBuf,
    /// The CLI binary that CLI scenarios start.
    pub binary_path: PathBuf,
    /// Optional config file passed to the CLI binary.
    pub cli_config_path: Option<PathBuf>,
    /// Default timeout of a stage that does not set its own.
    pub stage_timeout: Duration,
    /// Timeout of each setup and teardown hook.
    pub setup_timeout: Duration,
    /// Bound on the whole run.
    pub global_timeout: Duration,
    pub poll_interval: Duration,
    /// Prefer the short variant of [HarnessConfig::timeout], for deterministic backends.
    pub fast_timeouts: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            http_base_url: DEFAULT_HTTP_URL.to_string(),
            workspace_path: PathBuf::from(DEFAULT_WORKSPACE),
            binary_path: PathBuf::from(DEFAULT_BINARY),
            cli_config_path: None,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fast_timeouts: false,
        }
    }
}

impl HarnessConfig {
    /// Pick between a timeout suited to a real backend and one for a fast, deterministic backend.
    pub fn timeout(&self, normal: Duration, fast: Duration) -> Duration {
        if self.fast_timeouts {
            fast
        } else {
            normal
        }
    }
}

impl From<&FlowcheckCli> for HarnessConfig {
    fn from(cli: &FlowcheckCli) -> Self {
        Self {
            http_base_url: cli.http_url.clone(),
            workspace_path: cli.workspace.clone(),
            binary_path: cli.binary.clone(),
            cli_config_path: cli.cli_config.clone(),
            stage_timeout: Duration::from_secs(cli.timeout_s),
            setup_timeout: Duration::from_secs(cli.setup_timeout_s),
            global_timeout: Duration::from_secs(cli.global_timeout_s),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            fast_timeouts: cli.fast_timeouts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let cli = FlowcheckCli::parse_from(["flowcheck"]);

        pretty_assertions::assert_eq!(HarnessConfig::default(), HarnessConfig::from(&cli));
    }

    #[test]
    fn cli_overrides_are_applied() {
        let cli = FlowcheckCli::parse_from([
            "flowcheck",
            "plan-workflow",
            "--http-url",
            "http://gateway:9000",
            "--timeout-s",
            "5",
            "--poll-interval-ms",
            "50",
            "--fast-timeouts",
        ]);
        let config = HarnessConfig::from(&cli);

        assert_eq!("http://gateway:9000", config.http_base_url);
        assert_eq!(Duration::from_secs(5), config.stage_timeout);
        assert_eq!(Duration::from_millis(50), config.poll_interval);
        assert_eq!(
            Duration::from_secs(1),
            config.timeout(Duration::from_secs(30), Duration::from_secs(1))
        );
    }
}
