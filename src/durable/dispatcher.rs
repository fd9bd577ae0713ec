//! Child-process dispatcher.
//!
//! Launches a named workflow either as a child of the calling instance or
//! inline in the caller's context, and logs the outcome on every branch.

use tracing::{error, info, warn};

use crate::durable::context::WorkflowContext;
use crate::durable::retry::RetryPolicy;
use crate::durable::runtime::WorkflowResult;
use crate::error::WorkflowError;

/// How to run a dispatched workflow.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub input: serde_json::Value,
    /// Run as a child instance (own id, own retries) instead of inline.
    pub as_child: bool,
    /// Child workflow id. Generated from the parent id when absent.
    pub id: Option<String>,
    /// Child retry policy. Defaults to `RetryPolicy::child_default()`.
    pub retry: Option<RetryPolicy>,
}

impl ExecuteOptions {
    pub fn child(input: serde_json::Value) -> Self {
        Self {
            input,
            as_child: true,
            ..Self::default()
        }
    }

    pub fn inline(input: serde_json::Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Default child id: `{parent_id}-{workflow}-{unix_millis}`.
pub fn default_child_id(parent_id: &str, workflow: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{parent_id}-{workflow}-{millis}")
}

/// Run `workflow` and pass its result through unchanged.
pub async fn execute(
    ctx: &mut WorkflowContext,
    workflow: &str,
    options: ExecuteOptions,
) -> WorkflowResult {
    let parent_id = ctx.workflow_id().to_string();

    let result = if options.as_child {
        let id = options
            .id
            .unwrap_or_else(|| default_child_id(&parent_id, workflow));
        let retry = options.retry.unwrap_or_else(RetryPolicy::child_default);

        info!(
            parent_id = %parent_id,
            workflow,
            child_id = %id,
            max_attempts = retry.maximum_attempts,
            "Dispatching child workflow"
        );
        ctx.execute_child(workflow, &id, options.input, &retry).await
    } else {
        let definition = ctx
            .runtime()
            .workflow(workflow)
            .ok_or_else(|| WorkflowError::NotRegistered {
                kind: "workflow",
                name: workflow.to_string(),
            })?;

        info!(parent_id = %parent_id, workflow, "Running workflow inline");
        definition.run(ctx, options.input).await
    };

    match &result {
        Ok(_) => info!(parent_id = %parent_id, workflow, "Dispatched workflow completed"),
        Err(e) if e.is_cancellation() => {
            warn!(parent_id = %parent_id, workflow, "Dispatched workflow cancelled")
        }
        Err(e) => error!(parent_id = %parent_id, workflow, error = %e, "Dispatched workflow failed"),
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::durable::runtime::{StartOptions, Workflow, WorkflowRuntime};

    /// Echoes its input along with the id it ran under.
    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult {
            Ok(json!({ "ran_as": ctx.workflow_id(), "input": input }))
        }
    }

    /// Fails until its shared counter reaches `succeed_on`.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl Workflow for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _ctx: &mut WorkflowContext, _input: serde_json::Value) -> WorkflowResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                return Err(WorkflowError::Failed(format!("attempt {call}")));
            }
            Ok(json!(call))
        }
    }

    /// Sleeps far longer than any test waits.
    struct Sleeper;

    #[async_trait]
    impl Workflow for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn run(&self, ctx: &mut WorkflowContext, _input: serde_json::Value) -> WorkflowResult {
            ctx.sleep(Duration::from_secs(3600)).await?;
            Ok(serde_json::Value::Null)
        }
    }

    /// Dispatches the workflow described by its input.
    struct Parent;

    #[async_trait]
    impl Workflow for Parent {
        fn name(&self) -> &str {
            "parent"
        }

        async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult {
            let target = input["target"].as_str().unwrap_or_default().to_string();
            let mut options = if input["as_child"].as_bool().unwrap_or(false) {
                ExecuteOptions::child(json!("hello"))
            } else {
                ExecuteOptions::inline(json!("hello"))
            };
            if let Some(id) = input["id"].as_str() {
                options = options.with_id(id);
            }
            options = options.with_retry(RetryPolicy::fixed(Duration::from_millis(5), 3));
            execute(ctx, &target, options).await
        }
    }

    fn runtime(calls: Arc<AtomicU32>, succeed_on: u32) -> Arc<WorkflowRuntime> {
        WorkflowRuntime::builder()
            .workflow(Arc::new(Parent))
            .workflow(Arc::new(Echo))
            .workflow(Arc::new(Sleeper))
            .workflow(Arc::new(Flaky { calls, succeed_on }))
            .build()
    }

    async fn run_parent(rt: &Arc<WorkflowRuntime>, id: &str, input: serde_json::Value) -> WorkflowResult {
        rt.start("parent", StartOptions::new(id, "test").with_input(input))
            .await
            .unwrap();
        rt.wait_for_completion(id).await
    }

    #[tokio::test]
    async fn child_gets_explicit_id() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 1);
        let out = run_parent(
            &rt,
            "p-1",
            json!({ "target": "echo", "as_child": true, "id": "custom-child" }),
        )
        .await
        .unwrap();
        assert_eq!(out["ran_as"], "custom-child");
        assert_eq!(out["input"], "hello");
    }

    #[tokio::test]
    async fn child_id_defaults_to_parent_prefix() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 1);
        let out = run_parent(&rt, "p-2", json!({ "target": "echo", "as_child": true }))
            .await
            .unwrap();
        let ran_as = out["ran_as"].as_str().unwrap();
        assert!(ran_as.starts_with("p-2-echo-"), "got {ran_as}");
        let millis = ran_as.trim_start_matches("p-2-echo-");
        assert!(millis.parse::<u128>().is_ok());
    }

    #[tokio::test]
    async fn inline_runs_in_parent_context() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 1);
        let out = run_parent(&rt, "p-3", json!({ "target": "echo" })).await.unwrap();
        assert_eq!(out["ran_as"], "p-3");
    }

    #[tokio::test]
    async fn child_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::clone(&calls), 3);
        let out = run_parent(&rt, "p-4", json!({ "target": "flaky", "as_child": true }))
            .await
            .unwrap();
        assert_eq!(out, json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn child_failure_surfaces_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::clone(&calls), 100);
        let err = run_parent(&rt, "p-5", json!({ "target": "flaky", "as_child": true }))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ChildFailed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parent_cancellation_is_not_a_business_failure() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 1);
        rt.start(
            "parent",
            StartOptions::new("p-6", "test")
                .with_input(json!({ "target": "sleeper", "as_child": true, "id": "p-6-child" })),
        )
        .await
        .unwrap();

        for _ in 0..100 {
            if rt.is_running("p-6-child").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        rt.cancel("p-6").await.unwrap();

        let err = rt.wait_for_completion("p-6").await.unwrap_err();
        assert!(err.is_cancellation());
        let child = rt.wait_for_completion("p-6-child").await.unwrap_err();
        assert!(child.is_cancellation());
    }

    #[tokio::test]
    async fn unknown_inline_workflow_is_rejected() {
        let rt = runtime(Arc::new(AtomicU32::new(0)), 1);
        let err = run_parent(&rt, "p-7", json!({ "target": "missing" })).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotRegistered { .. }));
    }
}
