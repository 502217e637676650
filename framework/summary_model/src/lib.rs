mod text;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

pub use text::{render_stage_list, render_summary_table, truncate_message};

/// The outcome of a single scenario run
///
/// This is an immutable copy of the live result that a scenario writes to while it runs. It is
/// produced once the scenario has completed and is what gets reported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSummary {
    /// The name of the scenario that was run
    pub scenario_name: String,
    /// When the scenario result was created
    pub start_time: DateTime<Utc>,
    /// When the scenario result was completed
    ///
    /// Only `None` if the summary was taken before the run completed.
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time`, stored in microseconds
    #[serde(with = "duration_micros")]
    pub duration: Duration,
    pub success: bool,
    /// A single summary error for the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Timing and count metrics from the scenario
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, serde_json::Value>,
    /// Scenario specific output data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Every error recorded during the run, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Non-fatal issues recorded during the run, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// One entry per stage that ran, in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageSummary>,
}

/// The outcome of one stage within a scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummary {
    pub name: String,
    pub success: bool,
    #[serde(with = "duration_micros")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageSummary {
    pub fn passed(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            success: true,
            duration,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            duration,
            error: Some(error.into()),
        }
    }
}

/// Pass and fail counts across a run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTotals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Everything reported for one invocation of the runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    /// The unique run id
    ///
    /// Chosen by the runner. Unique for each run.
    pub run_id: String,
    /// When the report was produced
    pub timestamp: DateTime<Utc>,
    pub results: Vec<ScenarioSummary>,
    pub summary: RunTotals,
}

impl RunReport {
    pub fn new(run_id: String, results: Vec<ScenarioSummary>) -> Self {
        let passed = results.iter().filter(|r| r.success).count();
        let summary = RunTotals {
            total: results.len(),
            passed,
            failed: results.len() - passed,
        };

        Self {
            run_id,
            timestamp: Utc::now(),
            results,
            summary,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }
}

/// Serialize the run report to a writer as indented JSON
pub fn store_run_report<W: Write>(report: &RunReport, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

/// Load a run report from a reader
pub fn load_run_report<R: Read>(reader: R) -> anyhow::Result<RunReport> {
    let reader = std::io::BufReader::new(reader);
    let report: RunReport = serde_json::from_reader(reader)?;
    Ok(report)
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(deserializer)?))
    }
}
