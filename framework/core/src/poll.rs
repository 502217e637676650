use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::context::{ContextDone, RunContext};

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The outcome of a single convergence check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    /// The condition holds, carrying whatever the check captured.
    Ready(T),
    /// The condition does not hold yet, optionally describing what was observed instead.
    Pending(Option<String>),
}

impl<T> PollStatus<T> {
    pub fn pending() -> Self {
        PollStatus::Pending(None)
    }

    pub fn observed(state: impl Into<String>) -> Self {
        PollStatus::Pending(Some(state.into()))
    }
}

/// A value captured by a successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Converged<T> {
    pub value: T,
    /// The number of checks made, including the successful one.
    pub ticks: u32,
    pub elapsed: Duration,
}

/// The poll's context finished before the condition held.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceTimeout {
    pub target: String,
    pub ticks: u32,
    pub reason: ContextDone,
    /// The most recent intermediate state or transient error seen by the check.
    pub last_observed: Option<String>,
}

impl Display for ConvergenceTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timed out waiting for {} after {} checks ({})",
            self.target, self.ticks, self.reason
        )?;
        if let Some(last_observed) = &self.last_observed {
            write!(f, ", last observed: {last_observed}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConvergenceTimeout {}

/// Fixed-interval polling against a system that has no "ready" signal.
///
/// The first check runs one interval after [Poller::poll] is called. Errors returned by the check
/// are treated as transient: they are logged and remembered, and polling continues. Only the
/// context decides when to give up.
#[derive(Debug, Clone)]
pub struct Poller {
    target: String,
    interval: Duration,
}

impl Poller {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn poll<T, F, Fut>(
        &self,
        ctx: &RunContext,
        mut check: F,
    ) -> Result<Converged<T>, ConvergenceTimeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<PollStatus<T>>>,
    {
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0;
        let mut last_observed = None;

        loop {
            if let Err(reason) = ctx.run(ticker.tick()).await {
                return Err(self.timed_out(ticks, reason, last_observed));
            }
            ticks += 1;

            let status = match ctx.run(check()).await {
                Ok(status) => status,
                Err(reason) => return Err(self.timed_out(ticks, reason, last_observed)),
            };

            match status {
                Ok(PollStatus::Ready(value)) => {
                    log::debug!("Converged on {} after {} checks", self.target, ticks);
                    return Ok(Converged {
                        value,
                        ticks,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(PollStatus::Pending(observed)) => {
                    log::trace!("Still waiting for {} (check {})", self.target, ticks);
                    if observed.is_some() {
                        last_observed = observed;
                    }
                }
                Err(e) => {
                    log::debug!("Transient error while waiting for {}: {:#}", self.target, e);
                    last_observed = Some(format!("error: {e:#}"));
                }
            }
        }
    }

    fn timed_out(
        &self,
        ticks: u32,
        reason: ContextDone,
        last_observed: Option<String>,
    ) -> ConvergenceTimeout {
        ConvergenceTimeout {
            target: self.target.clone(),
            ticks,
            reason,
            last_observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownHandle;

    #[tokio::test(start_paused = true)]
    async fn converges_on_third_tick() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));
        let deadline = ctx.deadline().unwrap();

        let mut calls = 0;
        let converged = Poller::new("third tick")
            .with_interval(Duration::from_millis(100))
            .poll(&ctx, || {
                calls += 1;
                let seen = calls;
                async move {
                    if seen >= 3 {
                        Ok(PollStatus::Ready(seen))
                    } else {
                        Ok(PollStatus::pending())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(3, converged.value);
        assert_eq!(3, converged.ticks);
        assert_eq!(Duration::from_millis(300), converged.elapsed);
        assert!(Instant::now() < deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn never_converging_times_out_within_one_tick_of_deadline() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(1));
        let deadline = ctx.deadline().unwrap();
        let interval = Duration::from_millis(300);

        let err = Poller::new("never")
            .with_interval(interval)
            .poll(&ctx, || async { Ok(PollStatus::<()>::observed("stage: drafting")) })
            .await
            .unwrap_err();

        assert_eq!(ContextDone::DeadlineExceeded, err.reason);
        assert_eq!(3, err.ticks);
        assert_eq!(Some("stage: drafting".to_string()), err.last_observed);
        assert!(Instant::now() <= deadline + interval);
        assert_eq!(
            "timed out waiting for never after 3 checks (deadline exceeded), last observed: stage: drafting",
            err.to_string()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_stop_polling() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_secs(5));

        let mut calls = 0;
        let converged = Poller::new("flaky")
            .with_interval(Duration::from_millis(50))
            .poll(&ctx, || {
                calls += 1;
                let seen = calls;
                async move {
                    if seen < 4 {
                        Err(anyhow::anyhow!("connection reset"))
                    } else {
                        Ok(PollStatus::Ready("done"))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!("done", converged.value);
        assert_eq!(4, converged.ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_reported_on_timeout() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_millis(250));

        let err = Poller::new("unreachable")
            .with_interval(Duration::from_millis(100))
            .poll(&ctx, || async {
                Err::<PollStatus<()>, _>(anyhow::anyhow!("HTTP 503"))
            })
            .await
            .unwrap_err();

        assert_eq!(Some("error: HTTP 503".to_string()), err.last_observed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_poll() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle);

        let trigger = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.shutdown();
        });

        let err = Poller::new("cancelled")
            .with_interval(Duration::from_millis(100))
            .poll(&ctx, || async { Ok(PollStatus::<()>::pending()) })
            .await
            .unwrap_err();

        assert_eq!(ContextDone::Cancelled, err.reason);
        assert_eq!(2, err.ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_is_interrupted_by_deadline() {
        let handle = ShutdownHandle::new();
        let ctx = RunContext::new(&handle).with_timeout(Duration::from_millis(500));

        let err = Poller::new("slow")
            .with_interval(Duration::from_millis(100))
            .poll(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(PollStatus::Ready(()))
            })
            .await
            .unwrap_err();

        assert_eq!(ContextDone::DeadlineExceeded, err.reason);
        assert_eq!(1, err.ticks);
    }
}
