//! Per-request cancellation and deadline propagation.
use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Cancellation and deadline for a single operation.
///
/// Every facade operation takes a `RequestContext`. Once the context is cancelled or its deadline
/// passes, in-flight operations return [`Error::Cancelled`] or [`Error::DeadlineExceeded`] instead
/// of completing, and no further store mutation is issued on its behalf.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> RequestContext {
        RequestContext::default()
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> RequestContext {
        RequestContext {
            cancellation: token,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> RequestContext {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> RequestContext {
        self.deadline = Some(deadline);
        self
    }

    /// A child context: cancelled when `self` is, but cancelling it does not affect `self`.
    pub fn child(&self) -> RequestContext {
        RequestContext {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or times out first, in which
    /// case `fut` is dropped.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RequestContext;
    use crate::Error;

    #[tokio::test]
    async fn runs_future_to_completion() {
        let ctx = RequestContext::background();
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let ctx = RequestContext::background();
        ctx.cancel();

        assert!(matches!(ctx.check(), Err(Error::Cancelled)));
        assert!(matches!(
            ctx.run(async { Ok(()) }).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_future() {
        let ctx = RequestContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: crate::Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_future() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(10));

        let result: crate::Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let parent = RequestContext::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
