//! Caller deadlines and cancellation for orchestration calls.
//!
//! Every wait on an asynchronous notification is bound to a [`Context`]. The
//! context carries an optional deadline and a cancellation token; a wait
//! resolves to [`Error::Timeout`] or [`Error::Cancelled`] when either fires
//! first. Server-side work triggered before the wait is not rolled back.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation scope for one orchestration call.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context with no deadline that is never cancelled by itself.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// A child context whose deadline is the earlier of the parent's and `timeout` from now.
    ///
    /// Cancelling the parent cancels the child.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token for wiring cancellation into other tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `fut` until it completes, the deadline passes, or the context is cancelled.
    ///
    /// `what` names the awaited event in the resulting error.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled(what.to_string())),
            result = fut => result,
            _ = deadline => Err(Error::Timeout(what.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let value = ctx.run("value", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let err = ctx
            .run("never", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(ref what) if what == "never"));
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let ctx = Context::background();
        let child = ctx.child_with_timeout(Duration::from_secs(5));
        ctx.cancel();
        let err = child
            .run("never", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let parent = Context::with_timeout(Duration::from_millis(10));
            let child = parent.child_with_timeout(Duration::from_secs(60));
            assert_eq!(child.deadline(), parent.deadline());

            let unbounded = Context::background();
            assert!(unbounded.remaining().is_none());
            let child = unbounded.child_with_timeout(Duration::from_secs(1));
            assert!(child.remaining().unwrap() <= Duration::from_secs(1));
        });
    }
}
