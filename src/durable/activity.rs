//! Activities: side-effecting units of work invoked from workflows.

use std::time::Duration;

use async_trait::async_trait;

use crate::durable::retry::RetryPolicy;
use crate::error::ActivityError;

/// An external operation a workflow can call with timeout and retry.
///
/// Inputs and outputs are JSON so that workflow code and activity code
/// only share a serialized contract.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Registration name.
    fn name(&self) -> &str;

    /// Run one attempt.
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError>;
}

/// Per-call activity options.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Upper bound for a single attempt. Exceeding it counts as a failed
    /// attempt for the retry policy.
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}
