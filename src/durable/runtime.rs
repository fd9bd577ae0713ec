//! In-process durable workflow runtime.
//!
//! Provides the substrate contract the conversation layer relies on:
//! - one running instance per workflow id (start-or-signal semantics)
//! - signals delivered to an instance in arrival order through its own channel
//! - timers, activity calls, and child workflows that observe cancellation
//!
//! Workflow bodies run as tokio tasks. Each instance is a single logical
//! thread: signals are buffered in an mpsc channel and applied by the body
//! between suspension points, never concurrently with it. State is held in
//! memory; crash replay is left to a production substrate.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::durable::activity::Activity;
use crate::durable::context::WorkflowContext;
use crate::error::WorkflowError;

/// Outcome of a workflow run.
pub type WorkflowResult = Result<serde_json::Value, WorkflowError>;

/// Completed run results kept for `wait_for_completion` lookups.
const RESULT_HISTORY_CAPACITY: usize = 1024;

/// A long-running process body.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Registration name.
    fn name(&self) -> &str;

    /// Run the workflow to completion.
    async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult;
}

/// A named, ordered message delivered into a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub payload: serde_json::Value,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Options for starting (or signalling) a workflow instance.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Workflow id; at most one running instance per id.
    pub id: String,
    /// Task queue label, recorded for observability.
    pub task_queue: String,
    /// Input passed to the workflow body when a new instance is created.
    pub input: serde_json::Value,
    /// Signal delivered to the instance, whether it is new or already running.
    pub signal: Option<Signal>,
}

impl StartOptions {
    pub fn new(id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_queue: task_queue.into(),
            input: serde_json::Value::Null,
            signal: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// What `start_or_signal` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new instance was created.
    Started,
    /// The signal was delivered to an already running instance.
    Signaled,
}

/// Bookkeeping for a running instance.
struct Instance {
    run_id: u64,
    workflow: String,
    signal_tx: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<WorkflowResult>>,
}

/// Everything needed to retire a finished run (and restart it on late signals).
struct FinishedRun {
    id: String,
    run_id: u64,
    definition: Arc<dyn Workflow>,
    task_queue: String,
    input: serde_json::Value,
    restartable: bool,
    signals: mpsc::UnboundedReceiver<Signal>,
    result: WorkflowResult,
}

/// Bounded map of the latest result per workflow id.
#[derive(Default)]
struct CompletedRuns {
    order: VecDeque<String>,
    results: HashMap<String, WorkflowResult>,
}

impl CompletedRuns {
    fn insert(&mut self, id: String, result: WorkflowResult) {
        if self.results.insert(id.clone(), result).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > RESULT_HISTORY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }
}

/// Builder collecting workflow and activity registrations.
#[derive(Default)]
pub struct RuntimeBuilder {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl RuntimeBuilder {
    pub fn workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        let name = workflow.name().to_string();
        debug!("Registered workflow: {}", name);
        self.workflows.insert(name, workflow);
        self
    }

    pub fn activity(mut self, activity: Arc<dyn Activity>) -> Self {
        let name = activity.name().to_string();
        debug!("Registered activity: {}", name);
        self.activities.insert(name, activity);
        self
    }

    pub fn build(self) -> Arc<WorkflowRuntime> {
        Arc::new(WorkflowRuntime {
            workflows: self.workflows,
            activities: self.activities,
            instances: Mutex::new(HashMap::new()),
            completed: Mutex::new(CompletedRuns::default()),
            next_run_id: AtomicU64::new(1),
            root: CancellationToken::new(),
        })
    }
}

/// The workflow runtime. Shared as `Arc<WorkflowRuntime>`.
pub struct WorkflowRuntime {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    activities: HashMap<String, Arc<dyn Activity>>,
    /// Running instances by workflow id. Lock order: `instances` before `completed`.
    instances: Mutex<HashMap<String, Instance>>,
    completed: Mutex<CompletedRuns>,
    next_run_id: AtomicU64,
    root: CancellationToken,
}

impl WorkflowRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Look up a registered workflow.
    pub fn workflow(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    /// Look up a registered activity.
    pub fn activity(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    /// Deliver `options.signal` to the instance with `options.id`, creating
    /// the instance first if none is running.
    ///
    /// Without a signal, an already running instance yields
    /// `WorkflowError::AlreadyStarted`.
    pub async fn start_or_signal(
        self: &Arc<Self>,
        workflow: &str,
        options: StartOptions,
    ) -> Result<StartOutcome, WorkflowError> {
        let definition = self
            .workflow(workflow)
            .ok_or_else(|| WorkflowError::NotRegistered {
                kind: "workflow",
                name: workflow.to_string(),
            })?;

        let mut instances = self.instances.lock().await;

        if let Some(instance) = instances.get(&options.id) {
            let Some(signal) = options.signal else {
                return Err(WorkflowError::AlreadyStarted {
                    workflow_id: options.id,
                });
            };
            if instance.workflow != workflow {
                warn!(
                    workflow_id = %options.id,
                    running = %instance.workflow,
                    requested = workflow,
                    "Signal addressed to a different workflow type than the running instance"
                );
            }
            debug!(workflow_id = %options.id, signal = %signal.name, "Signal delivered");
            instance
                .signal_tx
                .send(signal)
                .map_err(|_| WorkflowError::NotFound {
                    workflow_id: options.id.clone(),
                })?;
            return Ok(StartOutcome::Signaled);
        }

        let initial_signals = options.signal.clone().into_iter().collect();
        self.spawn_locked(
            &mut instances,
            definition,
            options,
            initial_signals,
            self.root.child_token(),
            true,
        );
        Ok(StartOutcome::Started)
    }

    /// Start a new instance; fails with `AlreadyStarted` if one is running.
    pub async fn start(
        self: &Arc<Self>,
        workflow: &str,
        options: StartOptions,
    ) -> Result<(), WorkflowError> {
        let options = StartOptions {
            signal: None,
            ..options
        };
        self.start_or_signal(workflow, options).await.map(|_| ())
    }

    /// Deliver a signal to a running instance.
    pub async fn signal(&self, workflow_id: &str, signal: Signal) -> Result<(), WorkflowError> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        instance
            .signal_tx
            .send(signal)
            .map_err(|_| WorkflowError::NotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Request cancellation of a running instance and its children.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        instance.cancel.cancel();
        info!(workflow_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Check if an instance is running.
    pub async fn is_running(&self, workflow_id: &str) -> bool {
        self.instances.lock().await.contains_key(workflow_id)
    }

    /// Get count of running instances.
    pub async fn running_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Wait for the current run of `workflow_id`, or return its last result.
    pub async fn wait_for_completion(&self, workflow_id: &str) -> WorkflowResult {
        let done = {
            let instances = self.instances.lock().await;
            match instances.get(workflow_id) {
                Some(instance) => instance.done.clone(),
                None => {
                    let completed = self.completed.lock().await;
                    return completed.results.get(workflow_id).cloned().unwrap_or_else(|| {
                        Err(WorkflowError::NotFound {
                            workflow_id: workflow_id.to_string(),
                        })
                    });
                }
            }
        };
        await_run(done, workflow_id).await
    }

    /// Last recorded result for `workflow_id`, without waiting.
    pub async fn result(&self, workflow_id: &str) -> Option<WorkflowResult> {
        self.completed.lock().await.results.get(workflow_id).cloned()
    }

    /// Cancel every running instance.
    pub fn shutdown(&self) {
        info!("Workflow runtime shutting down");
        self.root.cancel();
    }

    /// Launch a child instance under the parent's cancellation scope.
    pub(crate) async fn spawn_child(
        self: &Arc<Self>,
        workflow: &str,
        id: &str,
        input: serde_json::Value,
        parent: &CancellationToken,
    ) -> Result<watch::Receiver<Option<WorkflowResult>>, WorkflowError> {
        let definition = self
            .workflow(workflow)
            .ok_or_else(|| WorkflowError::NotRegistered {
                kind: "workflow",
                name: workflow.to_string(),
            })?;

        let mut instances = self.instances.lock().await;
        if instances.contains_key(id) {
            return Err(WorkflowError::AlreadyStarted {
                workflow_id: id.to_string(),
            });
        }

        let options = StartOptions::new(id, "child").with_input(input);
        Ok(self.spawn_locked(
            &mut instances,
            definition,
            options,
            Vec::new(),
            parent.child_token(),
            false,
        ))
    }

    /// Register and spawn an instance. Caller holds the `instances` lock.
    fn spawn_locked(
        self: &Arc<Self>,
        instances: &mut HashMap<String, Instance>,
        definition: Arc<dyn Workflow>,
        options: StartOptions,
        initial_signals: Vec<Signal>,
        cancel: CancellationToken,
        restartable: bool,
    ) -> watch::Receiver<Option<WorkflowResult>> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        for signal in initial_signals {
            // Receiver is alive: it is moved into the task below.
            let _ = signal_tx.send(signal);
        }
        let (done_tx, done_rx) = watch::channel(None);
        let name = definition.name().to_string();
        let id = options.id.clone();

        instances.insert(
            id.clone(),
            Instance {
                run_id,
                workflow: name.clone(),
                signal_tx,
                cancel: cancel.clone(),
                done: done_rx.clone(),
            },
        );

        info!(
            workflow_id = %id,
            workflow = %name,
            task_queue = %options.task_queue,
            run_id,
            "Workflow started"
        );

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut ctx =
                WorkflowContext::new(id.clone(), name.clone(), Arc::clone(&runtime), signal_rx, cancel);

            let result = match AssertUnwindSafe(definition.run(&mut ctx, options.input.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(WorkflowError::Failed(format!("workflow {id} panicked"))),
            };

            match &result {
                Ok(_) => info!(workflow_id = %id, workflow = %name, "Workflow completed"),
                Err(e) if e.is_cancellation() => {
                    warn!(workflow_id = %id, workflow = %name, "Workflow cancelled")
                }
                Err(e) => error!(workflow_id = %id, workflow = %name, error = %e, "Workflow failed"),
            }

            runtime
                .retire(FinishedRun {
                    id,
                    run_id,
                    definition,
                    task_queue: options.task_queue,
                    input: options.input,
                    restartable,
                    signals: ctx.into_signal_receiver(),
                    result: result.clone(),
                })
                .await;

            let _ = done_tx.send(Some(result));
        });

        done_rx
    }

    /// Remove a finished run. Signals that arrived after the body returned
    /// start a fresh run so they are not lost, unless the run was cancelled.
    async fn retire(self: &Arc<Self>, mut finished: FinishedRun) {
        let mut instances = self.instances.lock().await;

        let is_current = instances
            .get(&finished.id)
            .is_some_and(|instance| instance.run_id == finished.run_id);
        if is_current {
            instances.remove(&finished.id);
        }

        let mut late = Vec::new();
        while let Ok(signal) = finished.signals.try_recv() {
            late.push(signal);
        }

        if !late.is_empty() {
            let cancelled = finished.result.as_ref().is_err_and(WorkflowError::is_cancellation);
            if is_current && finished.restartable && !cancelled {
                info!(
                    workflow_id = %finished.id,
                    count = late.len(),
                    "Signals arrived after completion, starting a new run"
                );
                let options = StartOptions::new(finished.id.clone(), finished.task_queue.clone())
                    .with_input(finished.input.clone());
                self.spawn_locked(
                    &mut instances,
                    Arc::clone(&finished.definition),
                    options,
                    late,
                    self.root.child_token(),
                    true,
                );
            } else {
                warn!(
                    workflow_id = %finished.id,
                    dropped = late.len(),
                    "Dropping signals delivered to a finished workflow"
                );
            }
        }

        self.completed
            .lock()
            .await
            .insert(finished.id, finished.result);
    }
}

/// Wait until a run publishes its result.
pub(crate) async fn await_run(
    mut done: watch::Receiver<Option<WorkflowResult>>,
    workflow_id: &str,
) -> WorkflowResult {
    loop {
        let current = done.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if done.changed().await.is_err() {
            let current = done.borrow().clone();
            return current.unwrap_or_else(|| {
                Err(WorkflowError::Failed(format!(
                    "workflow {workflow_id} ended without a result"
                )))
            });
        }
    }
}
