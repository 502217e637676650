use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flowcheck_client::prelude::{
    follow_message_log, CaptureSubscription, FilesystemClient, PlanScope, TaskDocument,
    WorkflowApi,
};
use flowcheck_runner::prelude::*;
use serde::Deserialize;

use crate::common::{
    connect, ensure_no_error, expected_slug, llm_wait, slugify, WorkflowValues, LLM_STAGE_TIMEOUT,
};

const PLAN_TITLE: &str = "authentication options";
const PLAN_GOAL: &str = "Explore OAuth, JWT, and session-based auth approaches";
const PLAN_CONTEXT: &str = "Need to evaluate authentication options for the API";

/// Share of the edited plan fields that must survive approval.
const MIN_PRESERVED: f64 = 0.75;

pub fn definition() -> ScenarioDefinitionBuilder<WorkflowValues> {
    ScenarioDefinitionBuilder::new("plan-workflow")
        .with_description("Creates, scopes and approves a plan through the HTTP API")
        .use_setup(connect)
        .use_stage_with_timeout("plan-create", LLM_STAGE_TIMEOUT, plan_create)
        .use_stage_with_timeout("plan-verify", LLM_STAGE_TIMEOUT, plan_verify)
        .use_stage("plan-update-scope", plan_update_scope)
        .use_stage("approve", approve)
        .use_stage("approve-verify", approve_verify)
        .use_stage("verify-reactive-state", verify_reactive_state)
        .use_stage("create-tasks", create_tasks)
        .use_stage("tasks-verify", tasks_verify)
}

fn plan_create(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let http = ctx.get().http()?;
        let slug = slugify(PLAN_TITLE);
        ctx.result().set_detail("plan_title", PLAN_TITLE);
        ctx.result().set_detail("expected_slug", slug.clone());

        let created = http
            .create_plan(ctx.run_context(), PLAN_TITLE)
            .await
            .context("create plan")?;
        ensure_no_error("plan creation", created.error.as_deref())?;

        if created.slug != slug {
            ctx.result().add_warning(format!(
                "engine chose slug '{}' rather than '{slug}'",
                created.slug
            ));
        }
        ctx.result().set_detail("plan_slug", created.slug);
        if let Some(trace_id) = created.trace_id {
            ctx.result().set_detail("plan_trace_id", trace_id);
        }

        Ok(())
    }
    .boxed()
}

fn plan_verify(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let values = ctx.get();
        let fs = values.fs()?;
        let slug = expected_slug(ctx.result())?;

        let events = CaptureSubscription::new("workflow.>");
        ctx.spawn_listener(follow_message_log(
            Arc::new(values.http()?.clone()),
            ctx.run_context().clone(),
            events.clone(),
            ctx.config().poll_interval,
        ));

        let wait = ctx.run_context().with_timeout(llm_wait(ctx.config()));
        let found = fs
            .wait_for_path(
                &wait,
                FilesystemClient::plan_file(&slug),
                ctx.config().poll_interval,
            )
            .await
            .context("plan.json not created")?;
        ctx.result().set_metric("plan_file_checks", found.ticks);

        let plan = fs.read_plan(&slug).await.context("read plan.json")?;
        if plan.slug != slug {
            anyhow::bail!("plan.json has slug '{}', expected '{slug}'", plan.slug);
        }

        ctx.result().set_detail("plan_verified", true);
        ctx.result().set_detail("plan_id", plan.id);
        ctx.result()
            .set_metric("workflow_messages_seen", events.count());
        Ok(())
    }
    .boxed()
}

fn plan_update_scope(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let mut plan = fs.read_plan(&slug).await.context("read plan.json")?;
        plan.goal = Some(PLAN_GOAL.to_string());
        plan.context = Some(PLAN_CONTEXT.to_string());
        plan.scope = Some(PlanScope {
            include: vec!["api/auth/*".to_string(), "docs/auth.md".to_string()],
            exclude: vec!["api/legacy/*".to_string()],
            do_not_touch: Vec::new(),
        });
        fs.write_json(FilesystemClient::plan_file(&slug), &plan)
            .await
            .context("write plan.json")?;

        ctx.result().set_detail("scope_updated", true);
        Ok(())
    }
    .boxed()
}

fn approve(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let http = ctx.get().http()?;
        let slug = expected_slug(ctx.result())?;
        let slug = slug.as_str();
        let run_context = ctx.run_context();

        // A reviewer asking for changes may approve the same plan on a later pass.
        let policy = RetryPolicy::new(
            "promote plan",
            3,
            ctx.config()
                .timeout(Duration::from_secs(5), Duration::from_millis(200)),
        );
        let promoted = policy
            .run(run_context, ctx.result(), |attempt| async move {
                log::info!("Promoting plan {slug}, attempt {attempt}");
                let response = http
                    .promote_plan(run_context, slug)
                    .await
                    .context("promote plan")?;
                ensure_no_error("promote", response.error.as_deref())?;

                Ok::<_, anyhow::Error>(if response.needs_changes() {
                    let mut reason = response.review_summary.clone();
                    for violation in response.violations() {
                        reason.push_str("; ");
                        reason.push_str(&violation);
                    }
                    Attempt::Rejected(reason)
                } else {
                    Attempt::Accepted(response)
                })
            })
            .await?;

        let response = promoted.value;
        ctx.result().set_detail("approve_attempts", promoted.attempt);
        ctx.result()
            .set_detail("approve_http_status", response.http_status);
        ctx.result()
            .set_detail("approve_verdict", response.review_verdict);
        if let Some(stage) = response.stage {
            ctx.result().set_detail("approve_stage", stage);
        }
        Ok(())
    }
    .boxed()
}

fn approve_verify(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let wait = ctx.run_context().with_timeout(llm_wait(ctx.config()));
        let converged = ctx
            .poller("plan approval")
            .poll(&wait, || async {
                let plan = fs.read_plan(&slug).await?;
                Ok::<_, anyhow::Error>(match plan.is_approved() {
                    Some(true) => PollStatus::Ready(plan),
                    Some(false) => PollStatus::observed("approved: false"),
                    None => PollStatus::observed("no approved or committed field"),
                })
            })
            .await?;
        let plan = converged.value;

        if plan.approval_time().is_none() {
            anyhow::bail!("plan.json missing 'approved_at' field");
        }

        let scope = plan.scope.clone().unwrap_or_default();
        let mut report = SemanticReport::new();
        report
            .add(
                "goal_preserved",
                plan.goal.as_deref() == Some(PLAN_GOAL),
                format!("goal is {:?}", plan.goal),
            )
            .add(
                "context_preserved",
                plan.context.as_deref() == Some(PLAN_CONTEXT),
                format!("context is {:?}", plan.context),
            )
            .add(
                "scope_include_preserved",
                scope.include.iter().any(|path| path == "api/auth/*"),
                format!("include is {:?}", scope.include),
            )
            .add(
                "scope_exclude_preserved",
                scope.exclude.iter().any(|path| path == "api/legacy/*"),
                format!("exclude is {:?}", scope.exclude),
            );
        report.record_into(ctx.result(), "approve_verify_");
        report.ensure(MIN_PRESERVED)?;

        ctx.result().set_detail("approve_verified", true);
        Ok(())
    }
    .boxed()
}

#[derive(Debug, Deserialize)]
struct PlanReviewState {
    #[serde(default)]
    workflow_id: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    phase: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    iteration: u32,
    #[serde(default)]
    verdict: String,
}

/// The review loop keeps its state in the `WORKFLOWS` bucket. Its absence is not a failure since
/// the loop is optional.
fn verify_reactive_state(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let http = ctx.get().http()?;
        let slug = expected_slug(ctx.result())?;
        let result = ctx.result();

        let entries = match http.kv_entries(ctx.run_context(), "WORKFLOWS").await {
            Ok(entries) => entries,
            Err(e) => {
                result.set_detail("reactive_state_available", false);
                result.set_detail("reactive_state_note", format!("WORKFLOWS bucket: {e}"));
                return Ok(());
            }
        };

        let Some(entry) = entries.get(&format!("plan-review.{slug}")) else {
            result.set_detail("reactive_state_available", false);
            result.set_detail("reactive_state_note", "no plan-review state for this plan");
            return Ok(());
        };

        let state: PlanReviewState = serde_json::from_value(entry.value.clone())
            .context("unmarshal plan-review state")?;
        result.set_detail("reactive_state_available", true);
        result.set_detail("reactive_phase", state.phase);
        result.set_detail("reactive_status", state.status);
        result.set_detail("reactive_iteration", state.iteration);

        if state.workflow_id != "plan-review-loop" {
            anyhow::bail!(
                "unexpected workflow_id: got {:?}, want \"plan-review-loop\"",
                state.workflow_id
            );
        }
        if state.slug != slug {
            anyhow::bail!("unexpected slug in state: got {:?}, want {slug:?}", state.slug);
        }
        if !state.verdict.is_empty() {
            result.set_detail("reactive_verdict", state.verdict);
        }

        if let Ok(events) = http
            .message_log_entries(ctx.run_context(), 50, Some("workflow.events.plan.*"))
            .await
        {
            let subjects: Vec<_> = events.into_iter().map(|event| event.subject).collect();
            if !subjects.is_empty() {
                result.set_detail("reactive_events_found", subjects);
            }
        }

        result.set_detail("reactive_state_verified", true);
        Ok(())
    }
    .boxed()
}

fn create_tasks(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let tasks = [
            "Research OAuth 2.0 implementation options",
            "Evaluate JWT library options",
        ]
        .iter()
        .zip(1..)
        .map(|(description, sequence)| TaskDocument {
            id: format!("task.{slug}.{sequence}"),
            plan_id: Some(format!("plan.{slug}")),
            sequence,
            description: description.to_string(),
            task_type: "research".to_string(),
            status: "pending".to_string(),
            ..Default::default()
        })
        .collect::<Vec<_>>();

        fs.write_json(FilesystemClient::tasks_file(&slug), &tasks)
            .await
            .context("write tasks.json")?;

        ctx.result().set_detail("tasks_created", tasks.len());
        Ok(())
    }
    .boxed()
}

fn tasks_verify(ctx: StageContext<'_, WorkflowValues>) -> BoxFuture<'_, HookResult> {
    async move {
        let fs = ctx.get().fs()?;
        let slug = expected_slug(ctx.result())?;

        let tasks = fs.read_tasks(&slug).await.context("read tasks.json")?;
        if tasks.len() != 2 {
            anyhow::bail!("expected 2 tasks, got {}", tasks.len());
        }
        if let Some(task) = tasks.iter().find(|task| !task.id.contains(&slug)) {
            anyhow::bail!("task ID '{}' doesn't contain slug '{slug}'", task.id);
        }

        ctx.result().set_detail("tasks_verified", true);
        ctx.result().set_detail("task_count", tasks.len());
        Ok(())
    }
    .boxed()
}
