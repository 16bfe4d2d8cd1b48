//! Per-operation cancellation and deadlines
//!
//! Every request, retry wait and poll wait runs under an `OperationContext`.
//! Cancelling the token or passing the deadline aborts whatever is in flight
//! at the next suspension point, without waiting for natural timeouts.

use std::future::Future;
use std::time::Duration;

use common::TimeoutSettings;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Resource operation a context is built for. Each has its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
}

impl OperationKind {
    pub fn label(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// Cancellation token plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context for a resource operation using its configured budget.
    pub fn for_operation(timeouts: &TimeoutSettings, kind: OperationKind) -> Self {
        let budget = match kind {
            OperationKind::Create => timeouts.create(),
            OperationKind::Read => timeouts.read(),
            OperationKind::Update => timeouts.update(),
            OperationKind::Delete => timeouts.delete(),
        };
        Self::with_timeout(budget)
    }

    /// Child context: cancelled with the parent, deadline is the earlier of
    /// the two.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(self.deadline.map_or(candidate, |d| d.min(candidate))),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if already cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::Timeout("operation deadline exceeded".into()));
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            _ = until(self.deadline) => {
                Err(Error::Timeout("operation deadline exceeded".into()))
            }
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error on cancel or
    /// deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_deadline() {
        let ctx = OperationContext::background();
        let start = Instant::now();
        ctx.sleep(Duration::from_secs(30)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep_promptly() {
        let ctx = OperationContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(3600)).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_sleep_short() {
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn cancelled_context_fails_check() {
        let ctx = OperationContext::background();
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(Error::Canceled)));
        let result: Result<()> = ctx.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_cancel_and_earlier_deadline() {
        let parent = OperationContext::with_timeout(Duration::from_secs(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        parent.cancel();
        assert!(matches!(child.check(), Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn operation_budgets_come_from_settings() {
        let timeouts = TimeoutSettings {
            create_secs: 120,
            read_secs: 10,
            update_secs: 60,
            delete_secs: 30,
        };
        let ctx = OperationContext::for_operation(&timeouts, OperationKind::Read);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
    }
}
