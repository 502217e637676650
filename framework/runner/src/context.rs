use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use flowcheck_core::prelude::{Poller, RunContext};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::HarnessConfig;
use crate::result::ScenarioResult;

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

/// Handed to the setup and teardown hooks of a scenario.
///
/// Owns the scenario's values, typically the clients that its stages use. Setup fills them in,
/// stages read them and teardown releases whatever they hold.
#[derive(Debug)]
pub struct ScenarioContext<V: UserValuesConstraint> {
    run_context: RunContext,
    config: Arc<HarnessConfig>,
    result: Arc<ScenarioResult>,
    value: V,
}

impl<V: UserValuesConstraint> ScenarioContext<V> {
    pub(crate) fn new(
        run_context: RunContext,
        config: Arc<HarnessConfig>,
        result: Arc<ScenarioResult>,
    ) -> Self {
        Self {
            run_context,
            config,
            result,
            value: Default::default(),
        }
    }

    pub(crate) fn set_run_context(&mut self, run_context: RunContext) {
        self.run_context = run_context;
    }

    /// Bounded by the setup timeout, or for teardown by a fresh timeout of the same length.
    pub fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn result(&self) -> &Arc<ScenarioResult> {
        &self.result
    }

    pub fn get_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn get(&self) -> &V {
        &self.value
    }
}

/// Background tasks started by a stage, aborted when the stage finishes.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageListeners {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StageListeners {
    fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    pub(crate) fn abort_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if !handles.is_empty() {
            log::debug!("Stopping {} stage listener(s)", handles.len());
        }
        for handle in handles {
            handle.abort();
        }
    }
}

/// Everything a single stage step can use.
pub struct StageContext<'a, V: UserValuesConstraint> {
    stage_name: &'a str,
    run_context: RunContext,
    config: &'a HarnessConfig,
    result: Arc<ScenarioResult>,
    value: &'a V,
    listeners: StageListeners,
}

impl<'a, V: UserValuesConstraint> StageContext<'a, V> {
    pub(crate) fn new(
        stage_name: &'a str,
        run_context: RunContext,
        config: &'a HarnessConfig,
        result: Arc<ScenarioResult>,
        value: &'a V,
        listeners: StageListeners,
    ) -> Self {
        Self {
            stage_name,
            run_context,
            config,
            result,
            value,
            listeners,
        }
    }

    pub fn stage_name(&self) -> &'a str {
        self.stage_name
    }

    /// Bounded by the stage timeout and cancelled with the run.
    pub fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    pub fn config(&self) -> &'a HarnessConfig {
        self.config
    }

    pub fn result(&self) -> &Arc<ScenarioResult> {
        &self.result
    }

    pub fn get(&self) -> &'a V {
        self.value
    }

    /// A poller using the configured poll interval.
    pub fn poller(&self, target: impl Into<String>) -> Poller {
        Poller::new(target).with_interval(self.config.poll_interval)
    }

    /// Run `listener` in the background for the rest of this stage.
    ///
    /// The listener is aborted as soon as the stage step returns, whatever the outcome.
    pub fn spawn_listener<F>(&self, listener: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.listeners.push(tokio::spawn(listener));
    }
}
