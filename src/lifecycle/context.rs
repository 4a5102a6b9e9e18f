//! Cancellation and deadlines for orchestrator operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LifecycleError;

/// Cancellation signal plus optional deadline shared by every step of one
/// orchestrator call.
///
/// Any in-flight engine request (including an image pull or an interactive
/// session) is dropped as soon as the token is cancelled or the deadline
/// passes.
#[derive(Debug, Clone)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            started: Instant::now(),
        }
    }

    /// Fails operations that are still running `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Uses an externally owned token (e.g. one cancelled on Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drives `fut` until it completes, the token is cancelled, or the
    /// deadline passes, whichever happens first.
    pub async fn run<T, E, F>(&self, operation: &'static str, fut: F) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, E>>,
        LifecycleError: From<E>,
    {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled(operation));
        }

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(LifecycleError::Cancelled(operation)),
                res = fut => res.map_err(LifecycleError::from),
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or_else(|_| {
                    Err(LifecycleError::Timeout {
                        operation,
                        elapsed: self.started.elapsed(),
                    })
                }),
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = OperationContext::new();
        let value = ctx
            .run("noop", async { Ok::<_, EngineError>(7) })
            .await
            .expect("should succeed");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_converts_engine_errors() {
        let ctx = OperationContext::new();
        let err = ctx
            .run("list containers", async {
                Err::<(), _>(EngineError::Unavailable("socket missing".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_run_after_cancel_fails_fast() {
        let ctx = OperationContext::new();
        ctx.cancel();
        let err = ctx
            .run("pull image", async { Ok::<_, EngineError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled("pull image")));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let ctx = OperationContext::new();
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = ctx
            .run("exec session", std::future::pending::<Result<(), EngineError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled("exec session")));
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run("pull image", std::future::pending::<Result<(), EngineError>>())
            .await
            .unwrap_err();
        match err {
            LifecycleError::Timeout { operation, elapsed } => {
                assert_eq!(operation, "pull image");
                assert!(elapsed >= Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
