//! Workflow execution context: the only way a workflow body suspends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::durable::activity::ActivityOptions;
use crate::durable::retry::RetryPolicy;
use crate::durable::runtime::{
    Signal, StartOptions, StartOutcome, WorkflowResult, WorkflowRuntime, await_run,
};
use crate::error::{ActivityError, WorkflowError};

/// Handle given to a running workflow body.
///
/// Every suspension point (timers, activity calls, child workflows, signal
/// waits) observes the instance's cancellation token and returns
/// `WorkflowError::Cancelled` when it fires.
pub struct WorkflowContext {
    workflow_id: String,
    workflow_name: String,
    runtime: Arc<WorkflowRuntime>,
    signals: mpsc::UnboundedReceiver<Signal>,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: String,
        workflow_name: String,
        runtime: Arc<WorkflowRuntime>,
        signals: mpsc::UnboundedReceiver<Signal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            workflow_name,
            runtime,
            signals,
            cancel,
        }
    }

    pub(crate) fn into_signal_receiver(self) -> mpsc::UnboundedReceiver<Signal> {
        self.signals
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn runtime(&self) -> &Arc<WorkflowRuntime> {
        &self.runtime
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn cancelled(&self) -> WorkflowError {
        WorkflowError::Cancelled {
            workflow_id: self.workflow_id.clone(),
        }
    }

    /// Durable timer.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Take every signal delivered so far, in arrival order. Never blocks.
    pub fn drain_signals(&mut self) -> Vec<Signal> {
        let mut drained = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            drained.push(signal);
        }
        drained
    }

    /// Suspend until the next signal arrives or `timeout` elapses.
    pub async fn wait_for_signal(&mut self, timeout: Duration) -> Result<Option<Signal>, WorkflowError> {
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            signal = self.signals.recv() => signal,
            _ = tokio::time::sleep(timeout) => return Ok(None),
        };

        match received {
            Some(signal) => Ok(Some(signal)),
            None => {
                // Channel closed: nothing can wake us early any more.
                self.sleep(timeout).await?;
                Ok(None)
            }
        }
    }

    /// Run a registered activity with a per-attempt timeout and retry policy.
    pub async fn execute_activity(
        &self,
        name: &str,
        input: serde_json::Value,
        options: &ActivityOptions,
    ) -> WorkflowResult {
        let activity = self
            .runtime
            .activity(name)
            .ok_or_else(|| WorkflowError::NotRegistered {
                kind: "activity",
                name: name.to_string(),
            })?;

        let timeout = options.start_to_close_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                outcome = tokio::time::timeout(timeout, activity.execute(input.clone())) => outcome,
            };

            let (failure, retryable) = match outcome {
                Ok(Ok(output)) => {
                    debug!(workflow_id = %self.workflow_id, activity = name, attempt, "Activity completed");
                    return Ok(output);
                }
                Ok(Err(ActivityError::Retryable(reason))) => (
                    WorkflowError::ActivityFailed {
                        activity: name.to_string(),
                        attempts: attempt,
                        reason,
                    },
                    true,
                ),
                Ok(Err(ActivityError::NonRetryable(reason))) => (
                    WorkflowError::ActivityFailed {
                        activity: name.to_string(),
                        attempts: attempt,
                        reason,
                    },
                    false,
                ),
                Err(_) => (
                    WorkflowError::ActivityTimeout {
                        activity: name.to_string(),
                        attempts: attempt,
                        timeout,
                    },
                    true,
                ),
            };

            if !retryable || !options.retry.has_attempts_left(attempt) {
                return Err(failure);
            }

            let delay = options.retry.delay_for_attempt(attempt);
            warn!(
                workflow_id = %self.workflow_id,
                activity = name,
                attempt,
                retry_in = ?delay,
                error = %failure,
                "Activity attempt failed, retrying"
            );
            self.sleep(delay).await?;
        }
    }

    /// Launch a child workflow and wait for it, retrying failed runs.
    ///
    /// The child inherits this instance's cancellation scope.
    pub async fn execute_child(
        &self,
        workflow: &str,
        id: &str,
        input: serde_json::Value,
        retry: &RetryPolicy,
    ) -> WorkflowResult {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let done = self
                .runtime
                .spawn_child(workflow, id, input.clone(), &self.cancel)
                .await?;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = await_run(done, id) => result,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) if retry.has_attempts_left(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        workflow_id = %self.workflow_id,
                        child_id = id,
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "Child workflow failed, retrying"
                    );
                    self.sleep(delay).await?;
                }
                Err(e) => {
                    return Err(WorkflowError::ChildFailed {
                        workflow_id: id.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Start-or-signal another top-level workflow.
    pub async fn signal_with_start(
        &self,
        workflow: &str,
        options: StartOptions,
    ) -> Result<StartOutcome, WorkflowError> {
        self.runtime.start_or_signal(workflow, options).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::durable::activity::Activity;
    use crate::durable::runtime::Workflow;

    /// Fails the first `failures` attempts, then echoes its input.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(ActivityError::Retryable(format!("boom {call}")));
            }
            Ok(input)
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Activity for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
            Err(ActivityError::NonRetryable("bad input".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl Activity for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(serde_json::Value::Null)
        }
    }

    /// Runs the activity named in its input with a small fixed policy.
    struct CallActivity;

    #[async_trait]
    impl Workflow for CallActivity {
        fn name(&self) -> &str {
            "call_activity"
        }

        async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult {
            let name = input["activity"].as_str().unwrap_or_default().to_string();
            let options = ActivityOptions {
                start_to_close_timeout: Duration::from_secs(1),
                retry: RetryPolicy::fixed(Duration::from_millis(10), 3),
            };
            ctx.execute_activity(&name, serde_json::json!("payload"), &options)
                .await
        }
    }

    fn runtime(calls: Arc<AtomicU32>, failures: u32) -> Arc<WorkflowRuntime> {
        WorkflowRuntime::builder()
            .workflow(Arc::new(CallActivity))
            .activity(Arc::new(Flaky { failures, calls }))
            .activity(Arc::new(Rejecting))
            .activity(Arc::new(Slow))
            .build()
    }

    async fn call(rt: &Arc<WorkflowRuntime>, id: &str, activity: &str) -> WorkflowResult {
        rt.start(
            "call_activity",
            StartOptions::new(id, "test").with_input(serde_json::json!({ "activity": activity })),
        )
        .await
        .unwrap();
        rt.wait_for_completion(id).await
    }

    #[tokio::test]
    async fn activity_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::clone(&calls), 2);
        let out = call(&rt, "a-1", "flaky").await.unwrap();
        assert_eq!(out, serde_json::json!("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn activity_gives_up_after_policy_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::clone(&calls), 10);
        let err = call(&rt, "a-2", "flaky").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ActivityFailed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_activity_error_skips_retries() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 0);
        let err = call(&rt, "a-3", "rejecting").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ActivityFailed { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_timeout_counts_as_failed_attempt() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 0);
        let err = call(&rt, "a-4", "slow").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ActivityTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn missing_activity_is_reported() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 0);
        let err = call(&rt, "a-5", "nope").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotRegistered { kind: "activity", .. }));
    }
}
