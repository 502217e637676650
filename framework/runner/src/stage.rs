use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use flowcheck_core::prelude::{ContextDone, RunContext};
use flowcheck_summary_model::StageSummary;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use crate::config::HarnessConfig;
use crate::context::{StageContext, StageListeners, UserValuesConstraint};
use crate::definition::HookResult;
use crate::result::ScenarioResult;

pub type StageFn<V> = for<'a> fn(StageContext<'a, V>) -> BoxFuture<'a, HookResult>;

/// Why a stage did not complete.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("{0:#}")]
    Step(anyhow::Error),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
    /// The run's own deadline arrived before the stage timeout could.
    #[error("run deadline reached after {budget:?} (stage timeout {timeout:?})")]
    RunDeadline { budget: Duration, timeout: Duration },
    #[error("{0}")]
    Cancelled(ContextDone),
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {failure}")]
pub struct StageError {
    pub stage: String,
    pub failure: StageFailure,
}

/// A named step and the timeout it runs under.
pub struct Stage<V: UserValuesConstraint> {
    pub name: String,
    /// Falls back to [HarnessConfig::stage_timeout] when `None`.
    pub timeout: Option<Duration>,
    pub step: StageFn<V>,
}

impl<V: UserValuesConstraint> std::fmt::Debug for Stage<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The ordered stages of a scenario.
pub struct StagePlan<V: UserValuesConstraint> {
    stages: Vec<Stage<V>>,
}

impl<V: UserValuesConstraint> Default for StagePlan<V> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<V: UserValuesConstraint> StagePlan<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, stage: Stage<V>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|stage| stage.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_str())
    }

    /// Run the stages in order, stopping at the first one that fails.
    ///
    /// Each stage gets a metric `<stage>_duration_us` and an entry in the result's stage list. A
    /// failure is also recorded in the error list and as the result's summary error.
    pub async fn execute(
        &self,
        run_context: &RunContext,
        value: &V,
        config: &HarnessConfig,
        result: &Arc<ScenarioResult>,
    ) -> Result<(), StageError> {
        for stage in &self.stages {
            let timeout = stage.timeout.unwrap_or(config.stage_timeout);
            let stage_context = run_context.with_timeout(timeout);
            let listeners = StageListeners::default();

            log::info!("Starting stage: {}", stage.name);
            let started = Instant::now();

            let step = (stage.step)(StageContext::new(
                &stage.name,
                stage_context.clone(),
                config,
                result.clone(),
                value,
                listeners.clone(),
            ));
            let outcome = stage_context.run(AssertUnwindSafe(step).catch_unwind()).await;
            listeners.abort_all();

            let elapsed = started.elapsed();
            result.set_metric(
                format!("{}_duration_us", stage.name),
                u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            );

            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(StageFailure::Step(e)),
                Ok(Err(panic)) => Some(StageFailure::Panicked(panic_message(panic.as_ref()))),
                Err(ContextDone::DeadlineExceeded) => {
                    Some(deadline_failure(run_context, &stage_context, started, timeout))
                }
                Err(reason @ ContextDone::Cancelled) => Some(StageFailure::Cancelled(reason)),
            };

            let Some(failure) = failure else {
                log::info!("Stage {} passed in {:?}", stage.name, elapsed);
                result.add_stage(StageSummary::passed(&stage.name, elapsed));
                continue;
            };

            let message = failure.to_string();
            log::error!("Stage {} failed: {}", stage.name, message);
            result.add_stage(StageSummary::failed(&stage.name, elapsed, &message));
            result.add_error(format!("{}: {}", stage.name, message));

            let error = StageError {
                stage: stage.name.clone(),
                failure,
            };
            result.set_error(format!("{}: {}", stage.name, error));

            return Err(error);
        }

        Ok(())
    }
}

fn deadline_failure(
    run_context: &RunContext,
    stage_context: &RunContext,
    started: Instant,
    timeout: Duration,
) -> StageFailure {
    match (run_context.deadline(), stage_context.deadline()) {
        (Some(parent), Some(deadline)) if parent == deadline => StageFailure::RunDeadline {
            budget: deadline.saturating_duration_since(started),
            timeout,
        },
        _ => StageFailure::TimedOut { timeout },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
