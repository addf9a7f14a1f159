//! Cancellation and deadline propagation for storage calls.
//!
//! Every facade operation takes a `&Context`. The in-flight backend call is raced
//! against the context's cancellation token and deadline, and a lost race surfaces
//! as [`StoreError::Cancelled`] or [`StoreError::DeadlineExceeded`], never as a
//! canonical not-found kind.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context that expires after `timeout` (or earlier if the parent does).
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context that expires at `deadline` (or earlier if the parent does).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context that can be cancelled independently of its parent.
    #[must_use]
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast if the context is already done.
    ///
    /// # Errors
    /// Returns `StoreError::Cancelled` or `StoreError::DeadlineExceeded`.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    ///
    /// # Errors
    /// Returns the future's own error, or a cancellation-kind error if the
    /// context finished first. The future is dropped in that case.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Err(StoreError::Cancelled),
                    res = tokio::time::timeout_at(deadline, fut) => {
                        res.unwrap_or(Err(StoreError::DeadlineExceeded))
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => Err(StoreError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = Context::background();
        let out = ctx.run(async { Ok::<_, StoreError>(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = Context::background().with_cancel();
        ctx.cancel();
        let err = ctx
            .run(async { Ok::<_, StoreError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let parent = Context::background().with_cancel();
        let child = parent.with_timeout(Duration::from_secs(30));
        let waiter = tokio::spawn(async move {
            child
                .run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, StoreError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_surfaces_as_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded));
        assert!(err.is_cancellation());
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn child_deadline_never_outlives_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
