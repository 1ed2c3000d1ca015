use crate::error::{ProbeError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal plus an optional deadline, handed to every network
/// operation. Cloning is cheap and clones observe the same signal.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ProbeContext {
    /// A context that is never done unless cancelled.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Child context that can be cancelled without touching the parent.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Some` with the cancellation kind once the context is done.
    pub fn err(&self) -> Option<ProbeError> {
        if self.token.is_cancelled() {
            return Some(ProbeError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ProbeError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ProbeError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ProbeError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ProbeError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ProbeError::Cancelled
            }
        }
    }

    /// Races `fut` against the context; a done context wins ties.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = ProbeContext::background().with_timeout(Duration::from_millis(100));
        assert!(ctx.err().is_none());
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(100)));

        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(ProbeError::DeadlineExceeded)));
        assert!(ctx.err().unwrap().is_cancellation());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let parent = ProbeContext::background();
        let child = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        child.cancel();
        assert!(parent.err().is_none());
        assert!(matches!(child.err(), Some(ProbeError::Cancelled)));
        assert!(matches!(grandchild.check(), Err(ProbeError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_keeps_earlier_parent_deadline() {
        let parent = ProbeContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
