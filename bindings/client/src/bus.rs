use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcheck_core::prelude::{ConvergenceTimeout, RunContext};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ClientError;
use crate::http::WorkflowApi;

const MESSAGE_LOG_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedMessage {
    pub subject: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Accumulates messages seen on a subject pattern.
///
/// Clones share the same buffer, so one clone can be handed to whatever feeds the capture while
/// the stage waits on another.
#[derive(Debug, Clone)]
pub struct CaptureSubscription {
    subject: String,
    messages: Arc<Mutex<Vec<CapturedMessage>>>,
    count: Arc<watch::Sender<usize>>,
}

impl CaptureSubscription {
    pub fn new(subject: impl Into<String>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            subject: subject.into(),
            messages: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(count),
        }
    }

    /// The subject pattern this capture was opened for.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn push(&self, message: CapturedMessage) {
        let count = {
            let mut messages = self.messages.lock();
            messages.push(message);
            messages.len()
        };
        self.count.send_replace(count);
    }

    /// Whether any clone besides this one is still alive.
    fn is_held(&self) -> bool {
        Arc::strong_count(&self.messages) > 1
    }

    pub fn messages(&self) -> Vec<CapturedMessage> {
        self.messages.lock().clone()
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until at least `n` messages have been captured and return everything captured so far.
    pub async fn wait_for_count(
        &self,
        ctx: &RunContext,
        n: usize,
    ) -> Result<Vec<CapturedMessage>, ConvergenceTimeout> {
        let mut receiver = self.count.subscribe();
        let mut checks = 0;

        loop {
            checks += 1;
            let seen = *receiver.borrow_and_update();
            if seen >= n {
                log::debug!("Captured {seen} messages on {}", self.subject);
                return Ok(self.messages());
            }

            let reason = match ctx.run(receiver.changed()).await {
                Ok(Ok(())) => continue,
                // The sender lives as long as `self`, so this only means nothing more will arrive.
                Ok(Err(_)) => ctx.done().await,
                Err(reason) => reason,
            };

            return Err(ConvergenceTimeout {
                target: format!("{n} messages on {}", self.subject),
                ticks: checks,
                reason,
                last_observed: Some(format!("{} messages", self.count())),
            });
        }
    }
}

/// Publish and observe traffic on the system's message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        ctx: &RunContext,
        subject: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ClientError>;

    /// Open a capture for `subject`, which may use `*` for one token and a trailing `>` for the rest.
    fn subscribe(&self, subject: &str) -> CaptureSubscription;
}

/// A bus that lives entirely in this process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    subscriptions: Arc<Mutex<Vec<CaptureSubscription>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        ctx: &RunContext,
        subject: &str,
        payload: &serde_json::Value,
    ) -> Result<(), ClientError> {
        if let Some(reason) = ctx.check() {
            return Err(reason.into());
        }

        let message = CapturedMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        };
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(CaptureSubscription::is_held);
        for subscription in subscriptions.iter() {
            if subject_matches(subscription.subject(), subject) {
                subscription.push(message.clone());
            }
        }
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> CaptureSubscription {
        let subscription = CaptureSubscription::new(subject);
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(CaptureSubscription::is_held);
        subscriptions.push(subscription.clone());
        subscription
    }
}

pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Feed `capture` from the engine's message log until `ctx` is done.
///
/// Intended to be spawned as a stage listener. Entries already in the log when the listener
/// starts are skipped. Later entries are forwarded once each, oldest first, and only when their
/// subject matches the capture's pattern.
pub async fn follow_message_log(
    api: Arc<dyn WorkflowApi>,
    ctx: RunContext,
    capture: CaptureSubscription,
    interval: Duration,
) {
    let mut last_sequence = None;
    let mut has_baseline = false;

    loop {
        if has_baseline && ctx.sleep(interval).await.is_err() {
            return;
        }

        let mut entries = match api
            .message_log_entries(&ctx, MESSAGE_LOG_PAGE, Some(capture.subject()))
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Could not read message log for {}: {e}", capture.subject());
                if !has_baseline && ctx.sleep(interval).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if !has_baseline {
            has_baseline = true;
            last_sequence = entries.iter().map(|entry| entry.sequence).max();
            log::debug!(
                "Following message log for {} after sequence {last_sequence:?}",
                capture.subject()
            );
            continue;
        }

        entries.sort_by_key(|entry| entry.sequence);
        for entry in entries {
            if last_sequence.is_some_and(|last| entry.sequence <= last) {
                continue;
            }
            last_sequence = Some(entry.sequence);

            if !subject_matches(capture.subject(), &entry.subject) {
                continue;
            }

            let received_at = DateTime::parse_from_rfc3339(&entry.timestamp)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            capture.push(CapturedMessage {
                subject: entry.subject,
                payload: entry.raw_data.unwrap_or_default(),
                received_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::api::{
        CreatePlanResponse, GenerateTasksResponse, KvEntries, LogEntry, MessageResponse,
        PromotePlanResponse, Trajectory,
    };
    use crate::documents::{PlanDocument, TaskDocument};
    use flowcheck_core::prelude::{ContextDone, ShutdownHandle};
    use serde_json::json;

    /// Serves queued message-log pages, repeating the last good page once the queue runs dry.
    #[derive(Default)]
    struct ScriptedLog {
        pages: Mutex<VecDeque<Result<Vec<LogEntry>, ClientError>>>,
        last_page: Mutex<Vec<LogEntry>>,
        requested_subjects: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedLog {
        fn new(pages: Vec<Result<Vec<LogEntry>, ClientError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl WorkflowApi for ScriptedLog {
        async fn health_check(&self, _ctx: &RunContext) -> Result<(), ClientError> {
            Ok(())
        }

        async fn send_message(
            &self,
            _ctx: &RunContext,
            _content: &str,
        ) -> Result<MessageResponse, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn create_plan(
            &self,
            _ctx: &RunContext,
            _description: &str,
        ) -> Result<CreatePlanResponse, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn get_plan(
            &self,
            _ctx: &RunContext,
            _slug: &str,
        ) -> Result<PlanDocument, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn promote_plan(
            &self,
            _ctx: &RunContext,
            _slug: &str,
        ) -> Result<PromotePlanResponse, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn generate_tasks(
            &self,
            _ctx: &RunContext,
            _slug: &str,
        ) -> Result<GenerateTasksResponse, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn get_tasks(
            &self,
            _ctx: &RunContext,
            _slug: &str,
        ) -> Result<Vec<TaskDocument>, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn message_log_entries(
            &self,
            _ctx: &RunContext,
            _limit: usize,
            subject: Option<&str>,
        ) -> Result<Vec<LogEntry>, ClientError> {
            self.requested_subjects
                .lock()
                .push(subject.map(str::to_string));

            match self.pages.lock().pop_front() {
                Some(Ok(page)) => {
                    *self.last_page.lock() = page.clone();
                    Ok(page)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last_page.lock().clone()),
            }
        }

        async fn kv_entries(
            &self,
            _ctx: &RunContext,
            _bucket: &str,
        ) -> Result<KvEntries, ClientError> {
            unreachable!("not used by the message log follower")
        }

        async fn trajectory_by_trace(
            &self,
            _ctx: &RunContext,
            _trace_id: &str,
            _include_entries: bool,
        ) -> Result<Trajectory, ClientError> {
            unreachable!("not used by the message log follower")
        }
    }

    fn entry(sequence: u64, subject: &str) -> LogEntry {
        LogEntry {
            sequence,
            subject: subject.to_string(),
            raw_data: Some(json!({ "sequence": sequence })),
            ..Default::default()
        }
    }

    fn unavailable() -> ClientError {
        ClientError::Status {
            status: 503,
            body: "starting".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_log_follower_forwards_new_matching_entries_once() {
        let mut with_timestamp = entry(4, "workflow.task.generated");
        with_timestamp.timestamp = "2026-01-02T03:04:05Z".to_string();

        let api = Arc::new(ScriptedLog::new(vec![
            Ok(vec![entry(1, "workflow.plan.created")]),
            Err(unavailable()),
            Ok(vec![
                entry(3, "agent.task.started"),
                entry(1, "workflow.plan.created"),
                entry(2, "workflow.plan.created"),
            ]),
            Ok(vec![
                entry(2, "workflow.plan.created"),
                entry(3, "agent.task.started"),
                with_timestamp,
            ]),
        ]));
        let capture = CaptureSubscription::new("workflow.>");

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));
        let follower = tokio::spawn(follow_message_log(
            api.clone(),
            ctx.clone(),
            capture.clone(),
            Duration::from_millis(100),
        ));

        let messages = capture.wait_for_count(&ctx, 2).await.unwrap();
        assert_eq!(
            vec![json!({ "sequence": 2 }), json!({ "sequence": 4 })],
            messages.iter().map(|m| m.payload.clone()).collect::<Vec<_>>()
        );
        assert_eq!(
            "2026-01-02T03:04:05+00:00",
            messages[1].received_at.to_rfc3339()
        );

        // The last page keeps being served, none of it is new.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(2, capture.count());

        handle.shutdown();
        follower.await.unwrap();
        assert!(api
            .requested_subjects
            .lock()
            .iter()
            .all(|subject| subject.as_deref() == Some("workflow.>")));
    }

    #[tokio::test(start_paused = true)]
    async fn message_log_follower_retries_the_first_read() {
        let api = Arc::new(ScriptedLog::new(vec![
            Err(unavailable()),
            Ok(vec![entry(7, "workflow.plan.created")]),
            Ok(vec![
                entry(7, "workflow.plan.created"),
                entry(8, "workflow.plan.approved"),
            ]),
        ]));
        let capture = CaptureSubscription::new("workflow.plan.*");

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));
        tokio::spawn(follow_message_log(
            api,
            ctx.clone(),
            capture.clone(),
            Duration::from_millis(100),
        ));

        let messages = capture.wait_for_count(&ctx, 1).await.unwrap();

        assert_eq!("workflow.plan.approved", messages[0].subject);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(1, capture.count());
    }

    #[tokio::test]
    async fn dropped_captures_are_forgotten() {
        let bus = InMemoryBus::new();
        let kept = bus.subscribe("workflow.>");
        drop(bus.subscribe("workflow.>"));
        drop(bus.subscribe("agent.>"));

        let ctx = RunContext::new(&ShutdownHandle::new());
        bus.publish(&ctx, "workflow.plan.created", &json!({}))
            .await
            .unwrap();

        assert_eq!(1, bus.subscriptions.lock().len());
        assert_eq!(1, kept.count());
    }

    #[test]
    fn wildcards() {
        assert!(subject_matches("workflow.plan.created", "workflow.plan.created"));
        assert!(subject_matches("workflow.*.created", "workflow.plan.created"));
        assert!(subject_matches("workflow.>", "workflow.plan.created"));
        assert!(!subject_matches("workflow.>", "workflow"));
        assert!(!subject_matches("workflow.*", "workflow.plan.created"));
        assert!(!subject_matches("workflow.plan", "workflow.plan.created"));
        assert!(!subject_matches("agent.>", "workflow.plan.created"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_published_messages() {
        let bus = InMemoryBus::new();
        let capture = bus.subscribe("workflow.task.*");
        let other = bus.subscribe("agent.>");

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));

        let publisher = bus.clone();
        let publish_ctx = ctx.clone();
        tokio::spawn(async move {
            for n in 0..3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                publisher
                    .publish(&publish_ctx, "workflow.task.generated", &json!({ "n": n }))
                    .await
                    .unwrap();
            }
        });

        let messages = capture.wait_for_count(&ctx, 3).await.unwrap();

        assert_eq!(3, messages.len());
        assert_eq!(json!({ "n": 2 }), messages[2].payload);
        assert_eq!(0, other.count());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_count_reports_how_many_arrived() {
        let capture = CaptureSubscription::new("workflow.>");
        capture.push(CapturedMessage {
            subject: "workflow.plan.created".to_string(),
            payload: json!({}),
            received_at: Utc::now(),
        });

        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(1));
        let err = capture.wait_for_count(&ctx, 2).await.unwrap_err();

        assert_eq!(ContextDone::DeadlineExceeded, err.reason);
        assert_eq!(Some("1 messages".to_string()), err.last_observed);
        assert_eq!(
            "timed out waiting for 2 messages on workflow.> after 1 checks (deadline exceeded), last observed: 1 messages",
            err.to_string()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_respects_cancellation() {
        let bus = InMemoryBus::new();
        let capture = bus.subscribe(">");

        let handle = ShutdownHandle::new();
        handle.shutdown();
        let ctx = RunContext::new(&handle);

        let err = bus.publish(&ctx, "anything", &json!(null)).await.unwrap_err();

        assert!(matches!(err, ClientError::Interrupted(ContextDone::Cancelled)));
        assert_eq!(0, capture.count());
    }
}
