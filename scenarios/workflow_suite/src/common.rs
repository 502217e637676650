use std::time::Duration;

use anyhow::Context;
use flowcheck_client::prelude::{FilesystemClient, HttpClient, WorkflowApi};
use flowcheck_runner::prelude::*;

/// Stage timeout for anything that waits on a model.
pub const LLM_STAGE_TIMEOUT: Duration = Duration::from_secs(180);

/// How long to wait for the engine to produce something.
pub fn llm_wait(config: &HarnessConfig) -> Duration {
    config.timeout(Duration::from_secs(120), Duration::from_secs(15))
}

#[derive(Debug, Default)]
pub struct WorkflowValues {
    http: Option<HttpClient>,
    fs: Option<FilesystemClient>,
}

impl UserValuesConstraint for WorkflowValues {}

impl WorkflowValues {
    pub fn http(&self) -> anyhow::Result<&HttpClient> {
        self.http.as_ref().context("HTTP client was not set up")
    }

    pub fn fs(&self) -> anyhow::Result<&FilesystemClient> {
        self.fs.as_ref().context("filesystem client was not set up")
    }
}

/// Reset the workspace and wait for the engine to report healthy.
pub fn connect(ctx: &mut ScenarioContext<WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let config = ctx.config().clone();

        let fs = FilesystemClient::new(&config.workspace_path);
        fs.setup_workspace().await.context("setup workspace")?;

        let http = HttpClient::new(&config.http_base_url)?;
        http.wait_for_healthy(ctx.run_context(), config.poll_interval)
            .await
            .context("service not healthy")?;
        log::info!("Connected to {}", config.http_base_url);

        ctx.get_mut().http = Some(http);
        ctx.get_mut().fs = Some(fs);
        Ok(())
    }
    .boxed()
}

/// The slug the engine derives from a plan title.
pub fn slugify(title: &str) -> String {
    title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn expected_slug(result: &ScenarioResult) -> anyhow::Result<String> {
    result
        .detail_str("expected_slug")
        .context("expected_slug was not recorded by an earlier stage")
}

/// Turn an `error` field that the engine filled in into a stage failure.
pub fn ensure_no_error(what: &str, error: Option<&str>) -> anyhow::Result<()> {
    match error {
        Some(error) if !error.is_empty() => anyhow::bail!("{what} returned error: {error}"),
        _ => Ok(()),
    }
}
