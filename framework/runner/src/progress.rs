use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Displays a spinner while a scenario is running so the user can see that the run is alive.
pub(crate) fn start_progress(scenario_name: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {msg}",
    )?);
    pb.set_message(format!("Running {scenario_name}"));
    pb.enable_steady_tick(Duration::from_millis(120));

    Ok(pb)
}
