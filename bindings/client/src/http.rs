use std::time::Duration;

use async_trait::async_trait;
use flowcheck_core::prelude::{PollStatus, Poller, RunContext};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::api::{
    CreatePlanRequest, CreatePlanResponse, GenerateTasksResponse, KvEntries, LogEntry,
    MessageRequest, MessageResponse, PromotePlanResponse, Trajectory,
};
use crate::documents::{decode, PlanDocument, TaskDocument};
use crate::error::ClientError;

/// Some engine calls wait on a model round-trip before answering.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(240);

/// The workflow engine's HTTP surface.
///
/// Every call races the given context, so a cancelled or expired scenario never waits out a slow
/// request.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    async fn health_check(&self, ctx: &RunContext) -> Result<(), ClientError>;

    async fn send_message(
        &self,
        ctx: &RunContext,
        content: &str,
    ) -> Result<MessageResponse, ClientError>;

    async fn create_plan(
        &self,
        ctx: &RunContext,
        description: &str,
    ) -> Result<CreatePlanResponse, ClientError>;

    async fn get_plan(&self, ctx: &RunContext, slug: &str) -> Result<PlanDocument, ClientError>;

    async fn promote_plan(
        &self,
        ctx: &RunContext,
        slug: &str,
    ) -> Result<PromotePlanResponse, ClientError>;

    async fn generate_tasks(
        &self,
        ctx: &RunContext,
        slug: &str,
    ) -> Result<GenerateTasksResponse, ClientError>;

    async fn get_tasks(&self, ctx: &RunContext, slug: &str)
        -> Result<Vec<TaskDocument>, ClientError>;

    async fn message_log_entries(
        &self,
        ctx: &RunContext,
        limit: usize,
        subject: Option<&str>,
    ) -> Result<Vec<LogEntry>, ClientError>;

    async fn kv_entries(&self, ctx: &RunContext, bucket: &str) -> Result<KvEntries, ClientError>;

    async fn trajectory_by_trace(
        &self,
        ctx: &RunContext,
        trace_id: &str,
        include_entries: bool,
    ) -> Result<Trajectory, ClientError>;

    async fn wait_for_healthy(
        &self,
        ctx: &RunContext,
        interval: Duration,
    ) -> Result<(), ClientError> {
        Poller::new("service health")
            .with_interval(interval)
            .poll(ctx, || async {
                self.health_check(ctx).await?;
                Ok::<_, anyhow::Error>(PollStatus::Ready(()))
            })
            .await?;

        Ok(())
    }

    /// Wait for the message log to contain an entry on `subject`, returning the newest one.
    async fn wait_for_message_subject(
        &self,
        ctx: &RunContext,
        subject: &str,
        interval: Duration,
    ) -> Result<LogEntry, ClientError> {
        let converged = Poller::new(format!("message on {subject}"))
            .with_interval(interval)
            .poll(ctx, || async {
                let entries = self.message_log_entries(ctx, 50, Some(subject)).await?;
                Ok::<_, anyhow::Error>(match entries.into_iter().max_by_key(|entry| entry.sequence) {
                    Some(entry) => PollStatus::Ready(entry),
                    None => PollStatus::observed("no entries"),
                })
            })
            .await?;

        Ok(converged.value)
    }
}

/// [WorkflowApi] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Request {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked to be a base URL on construction.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        ctx: &RunContext,
        url: Url,
        request: RequestBuilder,
    ) -> Result<(u16, String), ClientError> {
        log::trace!("Sending request to {url}");

        let response = ctx
            .run(request.send())
            .await?
            .map_err(|source| ClientError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status().as_u16();
        let body = ctx
            .run(response.text())
            .await?
            .map_err(|source| ClientError::Request {
                url: url.to_string(),
                source,
            })?;

        log::trace!("Response from {url}: HTTP {status}");
        Ok((status, body))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &RunContext,
        request: RequestBuilder,
        url: Url,
        target: &'static str,
    ) -> Result<T, ClientError> {
        let (status, body) = self.send(ctx, url, request).await?;
        if !(200..300).contains(&status) {
            return Err(ClientError::status(status, &body));
        }

        Ok(decode(target, &body)?)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        ctx: &RunContext,
        url: Url,
        target: &'static str,
    ) -> Result<T, ClientError> {
        self.call(ctx, self.client.get(url.clone()), url, target)
            .await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        ctx: &RunContext,
        url: Url,
        body: Option<&B>,
        target: &'static str,
    ) -> Result<T, ClientError> {
        let mut request = self.client.post(url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        self.call(ctx, request, url, target).await
    }
}

#[async_trait]
impl WorkflowApi for HttpClient {
    async fn health_check(&self, ctx: &RunContext) -> Result<(), ClientError> {
        let url = self.endpoint(&["readyz"]);
        let (status, body) = self.send(ctx, url.clone(), self.client.get(url)).await?;

        if status != 200 {
            return Err(ClientError::status(status, &body));
        }
        Ok(())
    }

    async fn send_message(
        &self,
        ctx: &RunContext,
        content: &str,
    ) -> Result<MessageResponse, ClientError> {
        let request = MessageRequest {
            content: content.to_string(),
            user_id: "e2e-test".to_string(),
            channel_type: "e2e".to_string(),
            channel_id: format!("e2e-{}", nanoid::nanoid!()),
        };
        self.post(
            ctx,
            self.endpoint(&["agentic-dispatch", "message"]),
            Some(&request),
            "message response",
        )
        .await
    }

    async fn create_plan(
        &self,
        ctx: &RunContext,
        description: &str,
    ) -> Result<CreatePlanResponse, ClientError> {
        let request = CreatePlanRequest {
            description: description.to_string(),
        };
        self.post(
            ctx,
            self.endpoint(&["workflow-api", "plans"]),
            Some(&request),
            "create plan response",
        )
        .await
    }

    async fn get_plan(&self, ctx: &RunContext, slug: &str) -> Result<PlanDocument, ClientError> {
        self.get(ctx, self.endpoint(&["workflow-api", "plans", slug]), "plan")
            .await
    }

    async fn promote_plan(
        &self,
        ctx: &RunContext,
        slug: &str,
    ) -> Result<PromotePlanResponse, ClientError> {
        let url = self.endpoint(&["workflow-api", "plans", slug, "promote"]);
        let (status, body) = self
            .send(ctx, url.clone(), self.client.post(url))
            .await?;

        // 422 carries a review verdict asking for changes.
        if !(200..300).contains(&status) && status != 422 {
            return Err(ClientError::status(status, &body));
        }

        let mut response: PromotePlanResponse = decode("promote response", &body)?;
        response.http_status = status;
        Ok(response)
    }

    async fn generate_tasks(
        &self,
        ctx: &RunContext,
        slug: &str,
    ) -> Result<GenerateTasksResponse, ClientError> {
        self.post(
            ctx,
            self.endpoint(&["workflow-api", "plans", slug, "tasks", "generate"]),
            None::<&()>,
            "generate tasks response",
        )
        .await
    }

    async fn get_tasks(
        &self,
        ctx: &RunContext,
        slug: &str,
    ) -> Result<Vec<TaskDocument>, ClientError> {
        self.get(
            ctx,
            self.endpoint(&["workflow-api", "plans", slug, "tasks"]),
            "tasks",
        )
        .await
    }

    async fn message_log_entries(
        &self,
        ctx: &RunContext,
        limit: usize,
        subject: Option<&str>,
    ) -> Result<Vec<LogEntry>, ClientError> {
        let mut url = self.endpoint(&["message-logger", "entries"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(subject) = subject {
                query.append_pair("subject", subject);
            }
        }

        self.get(ctx, url, "message log entries").await
    }

    async fn kv_entries(&self, ctx: &RunContext, bucket: &str) -> Result<KvEntries, ClientError> {
        self.get(
            ctx,
            self.endpoint(&["message-logger", "kv", bucket]),
            "kv entries",
        )
        .await
    }

    async fn trajectory_by_trace(
        &self,
        ctx: &RunContext,
        trace_id: &str,
        include_entries: bool,
    ) -> Result<Trajectory, ClientError> {
        let mut url = self.endpoint(&["trajectory-api", "traces", trace_id]);
        url.query_pairs_mut().append_pair(
            "format",
            if include_entries { "json" } else { "summary" },
        );

        self.get(ctx, url, "trajectory").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_a_base_path() {
        let client = HttpClient::new("http://localhost:8180/engine/").unwrap();

        assert_eq!(
            "http://localhost:8180/engine/workflow-api/plans/auth%20options/promote",
            client
                .endpoint(&["workflow-api", "plans", "auth options", "promote"])
                .as_str()
        );
    }

    #[test]
    fn endpoints_from_a_bare_host() {
        let client = HttpClient::new("http://localhost:8180").unwrap();

        assert_eq!(
            "http://localhost:8180/readyz",
            client.endpoint(&["readyz"]).as_str()
        );
    }

    #[test]
    fn rejects_urls_that_cannot_be_a_base() {
        assert!(matches!(
            HttpClient::new("mailto:someone@example.com"),
            Err(ClientError::Url(_))
        ));
    }
}
