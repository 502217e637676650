use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use flowcheck_core::prelude::{RunContext, ShutdownHandle};
use flowcheck_summary_model::{
    render_stage_list, render_summary_table, store_run_report, RunReport, ScenarioSummary,
};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cli::FlowcheckCli;
use crate::config::HarnessConfig;
use crate::context::{ScenarioContext, UserValuesConstraint};
use crate::definition::{HookResult, ScenarioDefinition, ScenarioDefinitionBuilder, ScenarioHook};
use crate::init::init;
use crate::progress::start_progress;
use crate::shutdown::start_shutdown_listener;
use crate::stage::panic_message;

/// A scenario definition with its values type erased, so that scenarios with different values
/// can be registered in one suite.
pub trait RunnableScenario: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn run<'a>(
        self: Box<Self>,
        run_context: &'a RunContext,
        config: Arc<HarnessConfig>,
    ) -> BoxFuture<'a, ScenarioSummary>;
}

impl<V: UserValuesConstraint> RunnableScenario for ScenarioDefinition<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn run<'a>(
        self: Box<Self>,
        run_context: &'a RunContext,
        config: Arc<HarnessConfig>,
    ) -> BoxFuture<'a, ScenarioSummary> {
        run_scenario(*self, run_context, config).boxed()
    }
}

/// Run one scenario: setup, then the stages in order, then teardown.
///
/// Teardown runs however the scenario ended, including after a failed setup. It gets a fresh
/// context so that it can still clean up after the run has been cancelled.
pub async fn run_scenario<V: UserValuesConstraint>(
    definition: ScenarioDefinition<V>,
    run_context: &RunContext,
    config: Arc<HarnessConfig>,
) -> ScenarioSummary {
    log::info!("Running scenario: {}", definition.name);

    let result = Arc::new(crate::result::ScenarioResult::new(&definition.name));
    let mut scenario_context = ScenarioContext::<V>::new(
        run_context.with_timeout(config.setup_timeout),
        config.clone(),
        result.clone(),
    );

    let setup_outcome = match definition.setup_fn {
        Some(setup_fn) => call_hook(setup_fn, &mut scenario_context).await,
        None => Ok(()),
    };

    match setup_outcome {
        Ok(()) => {
            match definition
                .stages
                .execute(run_context, scenario_context.get(), &config, &result)
                .await
            {
                Ok(()) => result.set_success(true),
                Err(e) => log::error!("Scenario {} failed: {}", definition.name, e),
            }
        }
        Err(e) => {
            let message = format!("setup failed: {e:#}");
            log::error!("Scenario {} {}", definition.name, message);
            result.add_error(&message);
            result.set_error(message);
        }
    }

    result.complete();

    if let Some(teardown_fn) = definition.teardown_fn {
        scenario_context.set_run_context(
            RunContext::new(&ShutdownHandle::new()).with_timeout(config.setup_timeout),
        );

        // Don't fail the scenario if the teardown fails, the hook is documented as 'best effort'
        if let Err(e) = call_hook(teardown_fn, &mut scenario_context).await {
            result.add_warning(format!("teardown failed: {e:#}"));
        }
    }

    result.snapshot()
}

async fn call_hook<V: UserValuesConstraint>(
    hook: ScenarioHook<V>,
    scenario_context: &mut ScenarioContext<V>,
) -> HookResult {
    let run_context = scenario_context.run_context().clone();

    match run_context
        .run(AssertUnwindSafe(hook(scenario_context)).catch_unwind())
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => Err(anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref()))),
        Err(reason) => Err(anyhow::anyhow!(reason)),
    }
}

/// Run scenarios one after another, stopping early if the run is cancelled.
///
/// `on_complete` is called with each summary as soon as its scenario finishes.
pub async fn run_scenarios<F>(
    scenarios: Vec<Box<dyn RunnableScenario>>,
    run_context: &RunContext,
    config: Arc<HarnessConfig>,
    show_progress: bool,
    mut on_complete: F,
) -> Vec<ScenarioSummary>
where
    F: FnMut(&ScenarioSummary),
{
    let mut summaries = Vec::with_capacity(scenarios.len());

    for scenario in scenarios {
        if let Some(reason) = run_context.check() {
            log::warn!(
                "Run stopped ({}), skipping remaining scenarios from {}",
                reason,
                scenario.name()
            );
            break;
        }

        let progress = if show_progress {
            match start_progress(scenario.name()) {
                Ok(progress) => Some(progress),
                Err(e) => {
                    log::warn!("Could not start progress display: {e:?}");
                    None
                }
            }
        } else {
            None
        };

        let summary = scenario.run(run_context, config.clone()).await;

        if let Some(progress) = progress {
            progress.finish_and_clear();
        }

        on_complete(&summary);
        summaries.push(summary);
    }

    summaries
}

/// The scenarios that make up a test suite, and the command line that selects between them.
pub struct ScenarioSuite {
    cli: FlowcheckCli,
    scenarios: Vec<Box<dyn RunnableScenario>>,
}

impl ScenarioSuite {
    pub fn new(cli: FlowcheckCli) -> Self {
        Self {
            cli,
            scenarios: Vec::new(),
        }
    }

    /// Initialise logging, parse the command line and create an empty suite.
    pub fn new_with_init() -> Self {
        Self::new(init())
    }

    /// Register a scenario. Scenarios run in the order they are registered.
    pub fn with_scenario<V: UserValuesConstraint>(
        mut self,
        definition: ScenarioDefinitionBuilder<V>,
    ) -> Self {
        let definition = definition.build();
        if self.scenarios.iter().any(|s| s.name() == definition.name) {
            panic!("Scenario [{}] is already defined", definition.name);
        }

        self.scenarios.push(Box::new(definition));
        self
    }

    pub fn cli(&self) -> &FlowcheckCli {
        &self.cli
    }

    fn select(self) -> anyhow::Result<(FlowcheckCli, Vec<Box<dyn RunnableScenario>>)> {
        let Self { cli, scenarios } = self;

        let selected = match cli.selected_scenario() {
            None => scenarios,
            Some(name) => {
                let selected = scenarios
                    .into_iter()
                    .filter(|s| s.name() == name)
                    .collect::<Vec<_>>();
                if selected.is_empty() {
                    anyhow::bail!("unknown scenario: {}", name);
                }
                selected
            }
        };

        Ok((cli, selected))
    }
}

/// Run the scenarios selected on the command line and print the report.
///
/// Returns the report even if scenarios failed. Check [RunReport::all_passed] to decide the exit
/// status.
pub fn run(suite: ScenarioSuite) -> anyhow::Result<RunReport> {
    let run_id = nanoid::nanoid!();

    if suite.cli().is_list() {
        println!("Available scenarios:");
        for scenario in &suite.scenarios {
            println!("  {:<24} {}", scenario.name(), scenario.description());
        }
        return Ok(RunReport::new(run_id, Vec::new()));
    }

    let (cli, scenarios) = suite.select()?;
    let config = Arc::new(HarnessConfig::from(&cli));

    log::info!(
        "Starting run {} with {} scenario(s) against {}",
        run_id,
        scenarios.len(),
        config.http_base_url
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let shutdown_handle = start_shutdown_listener(&runtime)?;

    let json = cli.json;
    let results = runtime.block_on(async {
        let run_context = RunContext::new(&shutdown_handle).with_timeout(config.global_timeout);

        run_scenarios(
            scenarios,
            &run_context,
            config.clone(),
            cli.show_progress(),
            |summary| {
                if !json {
                    print_scenario_outcome(summary);
                }
            },
        )
        .await
    });

    let report = RunReport::new(run_id, results);

    if json {
        let mut stdout = std::io::stdout().lock();
        store_run_report(&report, &mut stdout).context("Failed to write run report")?;
        println!();
    } else {
        println!("{}", render_summary_table(&report));
    }

    Ok(report)
}

fn print_scenario_outcome(summary: &ScenarioSummary) {
    if summary.success {
        println!("✓ {} PASSED ({:?})", summary.scenario_name, summary.duration);
    } else {
        println!(
            "✗ {} FAILED: {}",
            summary.scenario_name,
            summary.error.as_deref().unwrap_or("unknown error")
        );
    }
    print!("{}", render_stage_list(summary));
}
