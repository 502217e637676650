use std::future::Future;
use std::time::Duration;

use flowcheck_core::prelude::{ContextDone, RunContext};

use crate::result::ScenarioResult;

/// The verdict of one attempt at an operation that may ask to be tried again.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Accepted(T),
    /// The system answered but wants another attempt, for example a reviewer verdict of
    /// "needs changes".
    Rejected(String),
}

/// An accepted value along with the 1-based attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The operation failed outright, retrying would not help.
    #[error(transparent)]
    Operation(anyhow::Error),
    #[error("{label} rejected after {attempts} attempts: {last_reason}")]
    Exhausted {
        label: String,
        attempts: u32,
        last_reason: String,
    },
    #[error(
        "{label} cancelled on attempt {attempt} ({reason}), last rejection: {}",
        .last_reason.as_deref().unwrap_or("none")
    )]
    Cancelled {
        label: String,
        attempt: u32,
        reason: ContextDone,
        last_reason: Option<String>,
    },
}

/// Bounded retries with a linear backoff of `base_backoff * attempt` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    label: String,
    max_attempts: u32,
    base_backoff: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is raised to 1 if it is zero.
    pub fn new(label: impl Into<String>, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            label: label.into(),
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The wait after a rejection on `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff * attempt
    }

    /// Run `operation` until it is accepted, fails hard or runs out of attempts.
    ///
    /// Every rejection is recorded on `result` as a warning. Both the operation and the backoff
    /// waits are abandoned if `ctx` finishes first.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RunContext,
        result: &ScenarioResult,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<Attempt<T>>>,
    {
        let mut last_reason = None;

        for attempt in 1..=self.max_attempts {
            log::debug!(
                "{} attempt {}/{}",
                self.label,
                attempt,
                self.max_attempts
            );

            let outcome = match ctx.run(operation(attempt)).await {
                Ok(outcome) => outcome.map_err(RetryError::Operation)?,
                Err(reason) => return Err(self.cancelled(attempt, reason, last_reason)),
            };

            match outcome {
                Attempt::Accepted(value) => return Ok(Retried { value, attempt }),
                Attempt::Rejected(reason) => {
                    result.add_warning(format!(
                        "{} attempt {}/{} rejected: {}",
                        self.label, attempt, self.max_attempts, reason
                    ));
                    last_reason = Some(reason);
                }
            }

            if attempt < self.max_attempts {
                if let Err(reason) = ctx.sleep(self.backoff_for(attempt)).await {
                    return Err(self.cancelled(attempt, reason, last_reason));
                }
            }
        }

        Err(RetryError::Exhausted {
            label: self.label.clone(),
            attempts: self.max_attempts,
            last_reason: last_reason.unwrap_or_default(),
        })
    }

    fn cancelled(
        &self,
        attempt: u32,
        reason: ContextDone,
        last_reason: Option<String>,
    ) -> RetryError {
        RetryError::Cancelled {
            label: self.label.clone(),
            attempt,
            reason,
            last_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcheck_core::prelude::ShutdownHandle;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn accepted_on_third_attempt() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle);
        let result = ScenarioResult::new("retry");
        let base = Duration::from_secs(2);

        let started = Instant::now();
        let retried = RetryPolicy::new("promote", 3, base)
            .run(&ctx, &result, |attempt| async move {
                if attempt < 3 {
                    Ok(Attempt::Rejected("needs_changes".to_string()))
                } else {
                    Ok(Attempt::Accepted("approved"))
                }
            })
            .await
            .unwrap();

        assert_eq!("approved", retried.value);
        assert_eq!(3, retried.attempt);
        assert_eq!(base * 3, started.elapsed());
        assert_eq!(
            vec![
                "promote attempt 1/3 rejected: needs_changes".to_string(),
                "promote attempt 2/3 rejected: needs_changes".to_string(),
            ],
            result.warnings()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn always_rejected_stops_after_max_attempts() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle);
        let result = ScenarioResult::new("retry");

        let mut calls = 0;
        let err = RetryPolicy::new("promote", 4, Duration::from_millis(10))
            .run(&ctx, &result, |attempt| {
                calls += 1;
                async move { Ok(Attempt::<()>::Rejected(format!("verdict {attempt}"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(4, calls);
        assert_eq!(4, result.warnings().len());
        match err {
            RetryError::Exhausted {
                attempts,
                last_reason,
                ..
            } => {
                assert_eq!(4, attempts);
                assert_eq!("verdict 4", last_reason);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_error_is_not_retried() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle);
        let result = ScenarioResult::new("retry");

        let mut calls = 0;
        let err = RetryPolicy::new("promote", 5, Duration::from_secs(1))
            .run(&ctx, &result, |_| {
                calls += 1;
                async { Err::<Attempt<()>, _>(anyhow::anyhow!("HTTP 500")) }
            })
            .await
            .unwrap_err();

        assert_eq!(1, calls);
        assert!(matches!(err, RetryError::Operation(_)));
        assert_eq!("HTTP 500", err.to_string());
        assert!(result.warnings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_backoff_cancels() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(3));
        let result = ScenarioResult::new("retry");

        let err = RetryPolicy::new("promote", 10, Duration::from_secs(2))
            .run(&ctx, &result, |_| async {
                Ok(Attempt::<()>::Rejected("needs_changes".to_string()))
            })
            .await
            .unwrap_err();

        match err {
            RetryError::Cancelled {
                attempt,
                reason,
                last_reason,
                ..
            } => {
                assert_eq!(2, attempt);
                assert_eq!(ContextDone::DeadlineExceeded, reason);
                assert_eq!(Some("needs_changes".to_string()), last_reason);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new("zero", 0, Duration::from_millis(100));

        assert_eq!(1, policy.max_attempts());
        assert_eq!(Duration::from_millis(300), policy.backoff_for(3));
    }
}
