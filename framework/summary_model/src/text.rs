use std::fmt::Write;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::{RunReport, ScenarioSummary};

const MAX_ERROR_LEN: usize = 80;

#[derive(Tabled)]
struct ScenarioRow {
    #[tabled(rename = "status")]
    status: &'static str,
    #[tabled(rename = "scenario")]
    scenario_name: String,
    #[tabled(rename = "stages")]
    stages: String,
    #[tabled(rename = "duration_ms")]
    duration_ms: u128,
    #[tabled(rename = "error")]
    error: String,
}

/// Shorten `message` to at most `max` characters, marking the cut with `...`.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }

    let keep = max.saturating_sub(3);
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// One line per stage with a pass/fail mark and its duration, followed by the error if it failed.
/// Warnings are listed after the stages, even when no stage ran.
pub fn render_stage_list(summary: &ScenarioSummary) -> String {
    let mut out = String::new();
    if !summary.stages.is_empty() {
        out.push_str("Stages:\n");
    }
    for stage in &summary.stages {
        let mark = if stage.success { "✓" } else { "✗" };
        let _ = writeln!(
            out,
            "  {} {} ({}ms)",
            mark,
            stage.name,
            stage.duration.as_millis()
        );
        if let Some(error) = &stage.error {
            let _ = writeln!(out, "      Error: {error}");
        }
    }

    for warning in &summary.warnings {
        let _ = writeln!(out, "  ! {warning}");
    }

    out
}

/// A table of every scenario in the report followed by the totals line.
pub fn render_summary_table(report: &RunReport) -> String {
    let rows = report
        .results
        .iter()
        .map(|result| ScenarioRow {
            status: if result.success { "PASSED" } else { "FAILED" },
            scenario_name: result.scenario_name.clone(),
            stages: format!(
                "{}/{}",
                result.stages.iter().filter(|s| s.success).count(),
                result.stages.len()
            ),
            duration_ms: result.duration.as_millis(),
            error: result
                .error
                .as_deref()
                .filter(|_| !result.success)
                .map(|e| truncate_message(e, MAX_ERROR_LEN))
                .unwrap_or_default(),
        })
        .collect::<Vec<_>>();

    let mut table = Table::new(rows);
    table.with(Style::modern());

    format!(
        "{}\n  Total: {} | Passed: {} | Failed: {}\n",
        table, report.summary.total, report.summary.passed, report.summary.failed
    )
}
