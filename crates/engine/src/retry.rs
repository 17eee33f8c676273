//! Retry protocol and the panic-containing invocation guard.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::context::RunContext;
use crate::error::{PanicError, StepError, TimeoutError};
use crate::step_instance::StepTracker;

/// Decides whether a failed step invocation should be re-run.
pub trait RetryPolicy: Send + Sync {
    /// Return the delay before the next attempt, or `None` to give up.
    /// `tried` is the number of retries already performed (0 on the first
    /// failure).
    fn should_retry(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        tried: u32,
    ) -> Option<Duration>;
}

/// Published retry statistics for a step instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub count: u32,
}

/// One step invocation: the user function bound to its typed inputs,
/// re-invocable for retries.
pub(crate) type StepCall<T> =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, Result<T, StepError>> + Send + Sync>;

/// Run one guarded invocation: panics unwind into a [`PanicError`] and the
/// optional timeout races the invocation against a timer.
pub(crate) async fn guarded<T>(
    call: &StepCall<T>,
    ctx: &RunContext,
    timeout: Option<Duration>,
) -> Result<T, StepError> {
    let attempt = AssertUnwindSafe(call(ctx.clone())).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(Box::new(TimeoutError(limit))),
        },
        None => attempt.await,
    };

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(Box::new(PanicError::from_payload(payload))),
    }
}

/// Invoke `call` until it succeeds or `policy` declines. The retry count
/// is published through `tracker` as it grows, so observers see progress.
pub(crate) async fn run_with_retry<T>(
    policy: &dyn RetryPolicy,
    tracker: &StepTracker,
    call: &StepCall<T>,
    ctx: &RunContext,
    timeout: Option<Duration>,
    step_name: &str,
) -> Result<T, StepError> {
    let mut result = guarded(call, ctx, timeout).await;

    while let Err(error) = &result {
        match policy.should_retry(error.as_ref(), tracker.retry_count()) {
            Some(delay) => {
                tracker.bump_retry();
                warn!(step = %step_name, retried = tracker.retry_count(), %error, ?delay, "step failed, retrying");
                tokio::time::sleep(delay).await;
                result = guarded(call, ctx, timeout).await;
            }
            None => break,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::step_instance::StepState;

    struct AlwaysRetry {
        max: u32,
    }

    impl RetryPolicy for AlwaysRetry {
        fn should_retry(
            &self,
            _error: &(dyn std::error::Error + Send + Sync + 'static),
            tried: u32,
        ) -> Option<Duration> {
            (tried < self.max).then_some(Duration::from_millis(1))
        }
    }

    fn failing_call(calls: Arc<AtomicU32>) -> StepCall<u32> {
        Arc::new(move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, StepError>("always fails".into())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn guard_converts_panics_into_errors() {
        let call: StepCall<u32> =
            Arc::new(|_ctx| async { panic!("kaboom") }.boxed());

        let err = guarded(&call, &RunContext::new(), None).await.unwrap_err();
        let panic_err = err.downcast_ref::<PanicError>().expect("panic error");
        assert_eq!(panic_err.message, "kaboom");
        assert!(!panic_err.backtrace.is_empty());
    }

    #[tokio::test]
    async fn guard_enforces_timeouts() {
        let call: StepCall<u32> = Arc::new(|_ctx| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            }
            .boxed()
        });

        let err = guarded(&call, &RunContext::new(), Some(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<TimeoutError>().is_some());
    }

    #[tokio::test]
    async fn retryer_runs_until_policy_declines() {
        let calls = Arc::new(AtomicU32::new(0));
        let call = failing_call(calls.clone());
        let tracker = StepTracker::new(StepState::Running);
        tracker.init_retry_report();

        let policy = AlwaysRetry { max: 3 };
        let result =
            run_with_retry(&policy, &tracker, &call, &RunContext::new(), None, "flaky").await;

        assert!(result.is_err());
        assert_eq!(tracker.retry_count(), 3);
        // 1 initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retryer_contains_panics_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let call: StepCall<u32> = {
            let calls = calls.clone();
            Arc::new(move |_ctx| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first attempt blows up");
                    }
                    Ok(7)
                }
                .boxed()
            })
        };

        let tracker = StepTracker::new(StepState::Running);
        tracker.init_retry_report();
        let policy = AlwaysRetry { max: 3 };
        let result =
            run_with_retry(&policy, &tracker, &call, &RunContext::new(), None, "flaky").await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(tracker.retry_count(), 1);
    }
}
