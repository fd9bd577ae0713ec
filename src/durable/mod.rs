//! Durable execution substrate.
//!
//! An in-process runtime giving workflows ordered signals, workflow-id
//! uniqueness, timers, activity retries, child workflows and cancellation.

pub mod activity;
pub mod context;
pub mod dispatcher;
pub mod retry;
pub mod runtime;

pub use activity::{Activity, ActivityOptions};
pub use context::WorkflowContext;
pub use dispatcher::{ExecuteOptions, execute};
pub use retry::RetryPolicy;
pub use runtime::{Signal, StartOptions, StartOutcome, Workflow, WorkflowResult, WorkflowRuntime};
