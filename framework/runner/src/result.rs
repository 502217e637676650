use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowcheck_summary_model::{ScenarioSummary, StageSummary};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Failure to read a typed detail back out of a [ScenarioResult].
#[derive(Debug, thiserror::Error)]
pub enum DetailError {
    #[error("detail '{0}' has not been recorded")]
    Missing(String),
    #[error("detail '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
struct ResultState {
    scenario_name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration: Duration,
    success: bool,
    error: Option<String>,
    metrics: BTreeMap<String, Value>,
    details: BTreeMap<String, Value>,
    errors: Vec<String>,
    warnings: Vec<String>,
    stages: Vec<StageSummary>,
}

/// The live outcome of one scenario run.
///
/// Stages and the background listeners they start all write to the same result, so every method
/// takes the single lock that guards the whole aggregate. Keys are never removed from the metric
/// and detail maps: the latest write for a key wins.
#[derive(Debug)]
pub struct ScenarioResult {
    state: Mutex<ResultState>,
}

impl ScenarioResult {
    pub fn new(scenario_name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(ResultState {
                scenario_name: scenario_name.into(),
                start_time: Utc::now(),
                end_time: None,
                duration: Duration::ZERO,
                success: false,
                error: None,
                metrics: BTreeMap::new(),
                details: BTreeMap::new(),
                errors: Vec::new(),
                warnings: Vec::new(),
                stages: Vec::new(),
            }),
        }
    }

    pub fn scenario_name(&self) -> String {
        self.state.lock().scenario_name.clone()
    }

    /// Stamp the end time and compute the duration.
    ///
    /// Only the first call has an effect so this is safe to call from every exit path.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.end_time.is_some() {
            return;
        }

        let end_time = Utc::now();
        state.duration = (end_time - state.start_time).to_std().unwrap_or_default();
        state.end_time = Some(end_time);
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().end_time.is_some()
    }

    pub fn set_success(&self, success: bool) {
        self.state.lock().success = success;
    }

    pub fn success(&self) -> bool {
        self.state.lock().success
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.state.lock().error = Some(error.into());
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn add_error(&self, error: impl Into<String>) {
        self.state.lock().errors.push(error.into());
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        let warning = warning.into();
        log::warn!("{warning}");
        self.state.lock().warnings.push(warning);
    }

    pub fn warnings(&self) -> Vec<String> {
        self.state.lock().warnings.clone()
    }

    pub fn add_stage(&self, stage: StageSummary) {
        self.state.lock().stages.push(stage);
    }

    pub fn stages(&self) -> Vec<StageSummary> {
        self.state.lock().stages.clone()
    }

    pub fn set_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.lock().metrics.insert(key.into(), value.into());
    }

    pub fn metric(&self, key: &str) -> Option<Value> {
        self.state.lock().metrics.get(key).cloned()
    }

    pub fn set_detail(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.lock().details.insert(key.into(), value.into());
    }

    /// Record any serializable value as a detail.
    pub fn set_detail_serialized<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.set_detail(key, value);
        Ok(())
    }

    pub fn detail(&self, key: &str) -> Option<Value> {
        self.state.lock().details.get(key).cloned()
    }

    /// The detail as a string, `None` if it is missing or not a string.
    pub fn detail_str(&self, key: &str) -> Option<String> {
        match self.state.lock().details.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// The detail as a bool, `None` if it is missing or not a bool.
    pub fn detail_bool(&self, key: &str) -> Option<bool> {
        self.state.lock().details.get(key).and_then(Value::as_bool)
    }

    pub fn detail_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, DetailError> {
        let value = self
            .detail(key)
            .ok_or_else(|| DetailError::Missing(key.to_string()))?;

        serde_json::from_value(value).map_err(|source| DetailError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// A copy of the current state for reporting.
    pub fn snapshot(&self) -> ScenarioSummary {
        let state = self.state.lock();
        ScenarioSummary {
            scenario_name: state.scenario_name.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            duration: state.duration,
            success: state.success,
            error: state.error.clone(),
            metrics: state.metrics.clone(),
            details: state.details.clone(),
            errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            stages: state.stages.clone(),
        }
    }
}
