use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle};

/// Why a [RunContext] stopped accepting work.
#[derive(derive_more::Error, derive_more::Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDone {
    #[display("cancelled by shutdown signal")]
    Cancelled,
    #[display("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope for harness work.
///
/// A context combines the run-wide shutdown signal with an optional deadline. Child contexts are
/// derived with [RunContext::with_timeout] and never outlive their parent: the child deadline is
/// the earlier of the parent deadline and the requested timeout.
#[derive(Clone, Debug)]
pub struct RunContext {
    shutdown_listener: DelegatedShutdownListener,
    deadline: Option<Instant>,
}

impl RunContext {
    /// A root context with no deadline that is cancelled when `shutdown_handle` signals.
    pub fn new(shutdown_handle: &ShutdownHandle) -> Self {
        Self {
            shutdown_listener: shutdown_handle.new_listener(),
            deadline: None,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let requested = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < requested => parent,
            _ => requested,
        };

        Self {
            shutdown_listener: self.shutdown_listener.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if this context is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Point in time check, returns the reason if this context is already done.
    pub fn check(&self) -> Option<ContextDone> {
        if self.shutdown_listener.should_shutdown() {
            return Some(ContextDone::Cancelled);
        }

        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextDone::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_some()
    }

    /// Resolves once the shutdown signal is received or the deadline elapses.
    pub async fn done(&self) -> ContextDone {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.shutdown_listener.wait_for_shutdown() => ContextDone::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextDone::DeadlineExceeded,
                }
            }
            None => {
                self.shutdown_listener.wait_for_shutdown().await;
                ContextDone::Cancelled
            }
        }
    }

    /// Run `fut` to completion unless this context finishes first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextDone> {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextDone> {
        self.run(tokio::time::sleep(duration)).await
    }
}
