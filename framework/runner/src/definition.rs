use std::time::Duration;

use futures::future::BoxFuture;

use crate::context::{ScenarioContext, UserValuesConstraint};
use crate::stage::{Stage, StageFn, StagePlan};

pub type HookResult = anyhow::Result<()>;

pub type ScenarioHook<V> = for<'a> fn(&'a mut ScenarioContext<V>) -> BoxFuture<'a, HookResult>;

/// The builder for a scenario definition.
///
/// A scenario is a setup hook, an ordered list of stages and a teardown hook. Stages run in the
/// order they are added.
pub struct ScenarioDefinitionBuilder<V: UserValuesConstraint> {
    /// The name of the scenario, which should be unique within the suite.
    ///
    /// This is the name used to select the scenario from the command line.
    name: String,
    description: String,
    /// Runs once before any stage. If it fails then no stage runs.
    setup_fn: Option<ScenarioHook<V>>,
    stages: StagePlan<V>,
    /// Runs once after the stages, or after a failed setup. Failures are recorded as warnings.
    teardown_fn: Option<ScenarioHook<V>>,
}

pub struct ScenarioDefinition<V: UserValuesConstraint> {
    pub name: String,
    pub description: String,
    pub setup_fn: Option<ScenarioHook<V>>,
    pub stages: StagePlan<V>,
    pub teardown_fn: Option<ScenarioHook<V>>,
}

impl<V: UserValuesConstraint> ScenarioDefinitionBuilder<V> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            setup_fn: None,
            stages: StagePlan::new(),
            teardown_fn: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Set the setup hook [ScenarioDefinitionBuilder::setup_fn] for this scenario.
    pub fn use_setup(mut self, setup_fn: ScenarioHook<V>) -> Self {
        self.setup_fn = Some(setup_fn);
        self
    }

    /// Add a stage that runs with the configured default stage timeout.
    pub fn use_stage(self, name: &str, step: StageFn<V>) -> Self {
        self.add_stage(name, None, step)
    }

    /// Add a stage with its own timeout.
    pub fn use_stage_with_timeout(self, name: &str, timeout: Duration, step: StageFn<V>) -> Self {
        self.add_stage(name, Some(timeout), step)
    }

    /// Set the teardown hook [ScenarioDefinitionBuilder::teardown_fn] for this scenario.
    pub fn use_teardown(mut self, teardown_fn: ScenarioHook<V>) -> Self {
        self.teardown_fn = Some(teardown_fn);
        self
    }

    fn add_stage(mut self, name: &str, timeout: Option<Duration>, step: StageFn<V>) -> Self {
        if self.stages.contains(name) {
            panic!("Stage [{}] is already defined", name);
        }

        self.stages.push(Stage {
            name: name.to_string(),
            timeout,
            step,
        });
        self
    }

    pub fn build(self) -> ScenarioDefinition<V> {
        ScenarioDefinition {
            name: self.name,
            description: self.description,
            setup_fn: self.setup_fn,
            stages: self.stages,
            teardown_fn: self.teardown_fn,
        }
    }
}
