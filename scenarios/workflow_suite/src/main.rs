use flowcheck_runner::prelude::*;

mod cli_help;
mod common;
mod plan_workflow;
mod task_generation;

fn main() -> FlowcheckResult<()> {
    let suite = ScenarioSuite::new_with_init()
        .with_scenario(plan_workflow::definition())
        .with_scenario(task_generation::definition())
        .with_scenario(cli_help::definition());

    let report = run(suite)?;
    if !report.all_passed() {
        anyhow::bail!(
            "{} of {} scenarios failed",
            report.summary.failed,
            report.summary.total
        );
    }

    Ok(())
}
