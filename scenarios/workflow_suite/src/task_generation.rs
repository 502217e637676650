use anyhow::Context;
use flowcheck_client::prelude::{FilesystemClient, PlanScope, TaskDocument, WorkflowApi};
use flowcheck_runner::prelude::*;

use crate::common::{
    connect, ensure_no_error, expected_slug, llm_wait, slugify, WorkflowValues, LLM_STAGE_TIMEOUT,
};

const PLAN_TITLE: &str = "LLM Task Generation Test";

pub fn definition() -> ScenarioDefinitionBuilder<WorkflowValues> {
    ScenarioDefinitionBuilder::new("task-generation")
        .with_description("Generates tasks with BDD acceptance criteria from an approved plan")
        .use_setup(connect)
        .use_stage_with_timeout("create-plan", LLM_STAGE_TIMEOUT, create_plan)
        .use_stage("add-goal-context-scope", add_goal_context_scope)
        .use_stage("trigger-task-generation", trigger_task_generation)
        .use_stage_with_timeout("wait-for-tasks", LLM_STAGE_TIMEOUT, wait_for_tasks)
        .use_stage("verify-bdd-criteria", verify_bdd_criteria)
        .use_stage("record-trajectory", record_trajectory)
}

fn create_plan(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let values = ctx.get();
        let (http, fs) = (values.http()?, values.fs()?);
        let slug = slugify(PLAN_TITLE);
        ctx.result().set_detail("plan_title", PLAN_TITLE);
        ctx.result().set_detail("expected_slug", slug.clone());

        let created = http
            .create_plan(ctx.run_context(), PLAN_TITLE)
            .await
            .context("create plan")?;
        ensure_no_error("plan creation", created.error.as_deref())?;

        let wait = ctx.run_context().with_timeout(llm_wait(ctx.config()));
        fs.wait_for_path(
            &wait,
            FilesystemClient::plan_file(&slug),
            ctx.config().poll_interval,
        )
        .await
        .context("plan.json not created")?;
        fs.read_plan(&slug).await.context("read plan.json")?;

        // Plans are created as drafts.
        let promoted = http
            .promote_plan(ctx.run_context(), &slug)
            .await
            .context("promote plan")?;
        if promoted.needs_changes() {
            ctx.result().add_warning(format!(
                "reviewer asked for changes before generation: {}",
                promoted.review_summary
            ));
        }

        ctx.result().set_detail("plan_created", true);
        Ok(())
    }
    .boxed()
}

fn add_goal_context_scope(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let mut plan = fs.read_plan(&slug).await.context("read plan.json")?;
        plan.goal = Some(
            "Add user authentication with JWT tokens for secure API access".to_string(),
        );
        plan.context = Some(
            "The current API endpoints are unauthenticated. We need to protect sensitive \
             endpoints with JWT-based authentication including login, token refresh, and logout \
             functionality."
                .to_string(),
        );
        plan.scope = Some(PlanScope {
            include: vec!["api/auth/".to_string(), "api/middleware/".to_string()],
            exclude: vec!["api/public/".to_string()],
            do_not_touch: vec!["api/health.go".to_string()],
        });
        fs.write_json(FilesystemClient::plan_file(&slug), &plan)
            .await
            .context("write plan.json")?;

        ctx.result().set_detail("scope_updated", true);
        Ok(())
    }
    .boxed()
}

fn trigger_task_generation(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let http = ctx.get().http()?;
        let slug = expected_slug(ctx.result())?;

        let response = http
            .generate_tasks(ctx.run_context(), &slug)
            .await
            .context("generate tasks")?;
        ensure_no_error("generate tasks", response.error.as_deref())?;

        ctx.result().set_detail("generation_triggered", true);
        if let Some(trace_id) = response.trace_id {
            ctx.result().set_detail("generation_trace_id", trace_id);
        }
        Ok(())
    }
    .boxed()
}

fn wait_for_tasks(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;
        let tasks_file = FilesystemClient::tasks_file(&slug);

        let wait = ctx.run_context().with_timeout(llm_wait(ctx.config()));
        let converged = ctx
            .poller("tasks.json from the task generator")
            .poll(&wait, || async {
                if !fs.file_exists(&tasks_file).await {
                    return Ok(PollStatus::observed("missing"));
                }

                // A partial write fails to decode and is retried on the next tick.
                let tasks = fs.read_tasks(&slug).await?;
                Ok::<_, anyhow::Error>(if tasks.is_empty() {
                    PollStatus::observed("empty task list")
                } else {
                    PollStatus::Ready(tasks)
                })
            })
            .await?;

        ctx.result().set_detail("task_count", converged.value.len());
        ctx.result().set_detail("tasks_created", true);
        ctx.result()
            .set_metric("task_generation_checks", converged.ticks);
        Ok(())
    }
    .boxed()
}

/// Check the generated tasks, collecting every problem before failing.
pub fn check_generated_tasks(tasks: &[TaskDocument]) -> SemanticReport {
    let mut report = SemanticReport::new();

    report.add(
        "tasks_generated",
        !tasks.is_empty(),
        format!("{} tasks", tasks.len()),
    );

    let with_bdd = tasks.iter().find(|task| {
        task.acceptance_criteria
            .iter()
            .any(|criterion| criterion.is_complete())
    });
    report.add(
        "bdd_criteria",
        with_bdd.is_some(),
        match with_bdd {
            Some(task) => format!("found in '{}'", task.description),
            None => "no tasks have BDD acceptance criteria (given/when/then)".to_string(),
        },
    );

    for (i, task) in tasks.iter().enumerate() {
        let missing: Vec<_> = [
            ("id", &task.id),
            ("description", &task.description),
            ("status", &task.status),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
        .collect();

        report.add(
            format!("task_{i}_fields"),
            missing.is_empty(),
            format!("missing {}", missing.join(", ")),
        );
    }

    report
}

fn verify_bdd_criteria(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let tasks = fs.read_tasks(&slug).await.context("read tasks.json")?;
        let report = check_generated_tasks(&tasks);
        report.record_into(ctx.result(), "bdd_");

        if let Some(first) = tasks.first() {
            if !first.id.contains(&slug) {
                ctx.result().add_warning(format!(
                    "task ID '{}' doesn't contain slug '{slug}'",
                    first.id
                ));
            }
            if report.has_failures() {
                ctx.result().set_detail_serialized("first_task", first)?;
            }
        }

        report.ensure(1.0)?;
        ctx.result().set_detail("all_tasks_valid", true);
        Ok(())
    }
    .boxed()
}

/// Record what generation cost. The trajectory store is optional, so nothing here fails the stage.
fn record_trajectory(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let http = ctx.get().http()?;
        let Some(trace_id) = ctx.result().detail_str("generation_trace_id") else {
            ctx.result()
                .add_warning("task generation did not return a trace id");
            return Ok(());
        };

        match http
            .trajectory_by_trace(ctx.run_context(), &trace_id, false)
            .await
        {
            Ok(trajectory) => {
                let result = ctx.result();
                result.set_metric("generation_model_calls", trajectory.model_calls);
                result.set_metric("generation_tokens_in", trajectory.tokens_in);
                result.set_metric("generation_tokens_out", trajectory.tokens_out);
                result.set_metric("generation_duration_ms", trajectory.duration_ms);
                result.set_detail("generation_status", trajectory.status);
            }
            Err(e) => ctx
                .result()
                .add_warning(format!("trajectory for {trace_id}: {e}")),
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcheck_client::prelude::AcceptanceCriterion;
    use pretty_assertions::assert_eq;

    fn task(id: &str, criteria: Vec<AcceptanceCriterion>) -> TaskDocument {
        TaskDocument {
            id: id.to_string(),
            description: format!("do {id}"),
            status: "pending".to_string(),
            acceptance_criteria: criteria,
            ..Default::default()
        }
    }

    fn criterion(given: &str, when: &str, then: &str) -> AcceptanceCriterion {
        AcceptanceCriterion {
            given: given.to_string(),
            when: when.to_string(),
            then: then.to_string(),
        }
    }

    #[test]
    fn one_complete_criterion_is_enough() {
        let tasks = vec![
            task("task.1", vec![criterion("", "login", "token")]),
            task("task.2", vec![criterion("a user", "they log in", "a JWT is returned")]),
        ];

        let report = check_generated_tasks(&tasks);

        assert!(!report.has_failures());
        assert_eq!(1.0, report.pass_rate());
    }

    #[test]
    fn every_problem_is_reported() {
        let mut broken = task("", vec![]);
        broken.status = String::new();
        let tasks = vec![task("task.1", vec![]), broken];

        let report = check_generated_tasks(&tasks);

        assert_eq!(
            vec![
                "bdd_criteria: no tasks have BDD acceptance criteria (given/when/then)".to_string(),
                "task_1_fields: missing id, status".to_string(),
            ],
            report.failures()
        );
        assert_eq!(0.5, report.pass_rate());
    }

    #[test]
    fn no_tasks_fails() {
        let report = check_generated_tasks(&[]);

        assert_eq!(0.0, report.pass_rate());
        assert!(report.ensure(1.0).is_err());
    }
}
