mod cli;
mod config;
mod context;
mod definition;
mod init;
mod progress;
mod result;
mod retry;
mod run;
mod semantic;
mod shutdown;
mod stage;
mod types;

pub mod prelude {
    pub use crate::cli::{FlowcheckCli, FlowcheckCommand};
    pub use crate::config::HarnessConfig;
    pub use crate::context::{ScenarioContext, StageContext, UserValuesConstraint};
    pub use crate::definition::{
        HookResult, ScenarioDefinition, ScenarioDefinitionBuilder, ScenarioHook,
    };
    pub use crate::init::init;
    pub use crate::result::{DetailError, ScenarioResult};
    pub use crate::retry::{Attempt, Retried, RetryError, RetryPolicy};
    pub use crate::run::{run, run_scenario, run_scenarios, RunnableScenario, ScenarioSuite};
    pub use crate::semantic::{SemanticCheck, SemanticReport};
    pub use crate::stage::{Stage, StageError, StageFailure, StageFn, StagePlan};
    pub use crate::types::FlowcheckResult;

    pub use flowcheck_core::prelude::*;
    pub use flowcheck_summary_model::{RunReport, ScenarioSummary, StageSummary};
    pub use futures::future::BoxFuture;
    pub use futures::FutureExt;
}
