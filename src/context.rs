//! Deadline-scoped execution contexts.
//!
//! Every externally-facing operation runs inside a [`Context`]: a cancellation token
//! plus an optional deadline. Cancelling a context (or letting its deadline pass)
//! aborts whatever is awaiting inside [`Context::run`], which in turn drops the
//! in-flight transaction and closes the channels feeding a streaming dataset.

use crate::error::{MortarError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self { token: CancellationToken::new(), deadline: None }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    /// Cancelling the parent cancels the child, not the other way round.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self { token: self.token.child_token(), deadline: Some(deadline) }
    }

    /// Child context sharing the parent's deadline.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` to completion unless the context is cancelled or its deadline passes first.
    ///
    /// The future is polled before the cancellation branch, so a failure that was
    /// recorded just before cancelling is reported instead of the cancellation.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = fut => result,
            _ = self.token.cancelled() => Err(MortarError::Cancelled(operation.to_string())),
            _ = deadline => Err(MortarError::DeadlineExceeded(operation.to_string())),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let value = ctx.run("noop", async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_reports_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let result: Result<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MortarError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_child() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        let result: Result<()> = child.run("blocked", std::future::pending()).await;
        assert!(matches!(result, Err(MortarError::Cancelled(_))));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(parent.deadline(), child.deadline());
    }
}
