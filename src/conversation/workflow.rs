//! Per-thread conversation workflow.
//!
//! One instance per thread id. Signals fill the state's queue; the control
//! loop drains it one item at a time, parsing each message and routing the
//! outcome through the configured [`OutcomeStrategy`]. The instance exits
//! once the thread is marked complete and nothing is left to parse.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ConversationConfig;
use crate::conversation::activities::{PARSE_THREAD, RECORD_TRIAGE, TriageRecord};
use crate::conversation::outcome::{OutcomeAction, OutcomeStrategy, ParseOutcome};
use crate::conversation::state::{ConversationPhase, ConversationState, WorkItem};
use crate::durable::activity::ActivityOptions;
use crate::durable::context::WorkflowContext;
use crate::durable::dispatcher::{self, ExecuteOptions};
use crate::durable::runtime::{Workflow, WorkflowResult};
use crate::error::WorkflowError;
use crate::store::traits::MessageStatus;

pub const RFQ_CONVERSATION: &str = "rfq_conversation";

/// Workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInput {
    pub thread_id: String,
}

/// Id of the conversation instance for a thread.
pub fn conversation_workflow_id(thread_id: &str) -> String {
    format!("rfq-conversation-{thread_id}")
}

pub struct ConversationWorkflow {
    config: ConversationConfig,
    strategy: Arc<dyn OutcomeStrategy>,
}

impl ConversationWorkflow {
    pub fn new(config: ConversationConfig, strategy: Arc<dyn OutcomeStrategy>) -> Self {
        Self { config, strategy }
    }

    fn parse_options(&self) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: self.config.parse_timeout,
            retry: self.config.parse_retry.clone(),
        }
    }

    /// Best-effort status write: the conversation is already on its way out
    /// when this runs.
    async fn record_status(&self, ctx: &WorkflowContext, message_id: &str, status: MessageStatus) {
        let record = TriageRecord {
            message_id: message_id.to_string(),
            status,
        };
        let Ok(input) = serde_json::to_value(&record) else {
            return;
        };
        if let Err(e) = ctx
            .execute_activity(RECORD_TRIAGE, input, &ActivityOptions::default())
            .await
        {
            warn!(message_id, %status, error = %e, "Failed to record message status");
        }
    }

    /// Return unparsed messages to `pending` so the poller forwards them again.
    /// Signals already delivered are absorbed first so they are not
    /// replayed into a fresh run.
    async fn release(&self, ctx: &mut WorkflowContext, state: &mut ConversationState) {
        for signal in ctx.drain_signals() {
            state.apply(&signal);
        }
        let items = state.take_queued();
        if items.is_empty() {
            return;
        }
        if ctx.is_cancelled() {
            // Activities cannot run any more; the startup requeue picks these up.
            warn!(thread_id = %state.thread_id(), count = items.len(), "Cancelled with messages still queued");
            return;
        }
        warn!(
            thread_id = %state.thread_id(),
            count = items.len(),
            "Conversation ended with messages still queued, returning them to pending"
        );
        for item in items {
            self.record_status(ctx, &item.message_id, MessageStatus::Pending).await;
        }
    }

    async fn drive(&self, ctx: &mut WorkflowContext, state: &mut ConversationState) -> WorkflowResult {
        let mut processed: u64 = 0;
        let parse_options = self.parse_options();

        loop {
            for signal in ctx.drain_signals() {
                state.apply(&signal);
            }

            match state.phase() {
                ConversationPhase::Terminated => break,
                ConversationPhase::AwaitingWork => {
                    if let Some(signal) = ctx.wait_for_signal(self.config.idle_interval).await? {
                        state.apply(&signal);
                    }
                    continue;
                }
                ConversationPhase::Draining => {}
            }

            let Some(item) = state.pop() else {
                continue;
            };
            debug!(
                thread_id = %item.thread_id,
                message_id = %item.message_id,
                remaining = state.queued(),
                "Parsing message"
            );

            let input = serde_json::to_value(&item)?;
            let output = match ctx.execute_activity(PARSE_THREAD, input, &parse_options).await {
                Ok(output) => output,
                Err(e) => {
                    state.requeue(item);
                    return Err(e);
                }
            };
            let outcome: ParseOutcome = serde_json::from_value(output)?;
            processed += 1;

            match self.strategy.route(&outcome) {
                Some(OutcomeAction::Continue) => {}
                Some(OutcomeAction::DispatchChild {
                    workflow,
                    id,
                    input,
                    terminal,
                }) => {
                    let dispatched = dispatcher::execute(ctx, &workflow, ExecuteOptions::child(input).with_id(id)).await;
                    if let Err(e) = dispatched {
                        state.requeue(item);
                        return Err(e);
                    }
                    if terminal {
                        return Ok(summary(state, processed, Some(&item)));
                    }
                }
                None => {
                    let described = outcome.summary();
                    warn!(thread_id = %state.thread_id(), outcome = %described, "Unhandled parse outcome");
                    self.record_status(ctx, &outcome.message_id, MessageStatus::Rejected)
                        .await;
                    return Err(WorkflowError::UnhandledOutcome {
                        thread_id: outcome.thread_id,
                        outcome: described,
                    });
                }
            }
        }

        info!(thread_id = %state.thread_id(), processed, "Conversation complete");
        Ok(summary(state, processed, None))
    }
}

#[async_trait]
impl Workflow for ConversationWorkflow {
    fn name(&self) -> &str {
        RFQ_CONVERSATION
    }

    async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult {
        let input: ConversationInput = serde_json::from_value(input)?;
        let mut state = ConversationState::new(input.thread_id);

        info!(workflow_id = %ctx.workflow_id(), thread_id = %state.thread_id(), "Conversation started");

        let result = self.drive(ctx, &mut state).await;
        self.release(ctx, &mut state).await;
        result
    }
}

fn summary(state: &ConversationState, processed: u64, dispatched_for: Option<&WorkItem>) -> serde_json::Value {
    json!({
        "thread_id": state.thread_id(),
        "processed": processed,
        "signals": state.counter(),
        "dispatched_for": dispatched_for.map(|i| i.message_id.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::conversation::outcome::{LineItem, SingleItemTriage};
    use crate::conversation::state::{COMPLETE_THREAD, NEW_MESSAGE};
    use crate::durable::activity::Activity;
    use crate::durable::retry::RetryPolicy;
    use crate::durable::runtime::{Signal, StartOptions, WorkflowRuntime};
    use crate::error::ActivityError;

    /// Records the order of parsed messages; item count is the digit in the id.
    /// Ids starting with `fail` always fail.
    #[derive(Default)]
    struct ScriptedParse {
        seen: Mutex<Vec<String>>,
        /// Holds the first parse open until notified.
        gate: Option<Arc<Notify>>,
        started: Notify,
    }

    impl ScriptedParse {
        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Activity for ScriptedParse {
        fn name(&self) -> &str {
            PARSE_THREAD
        }

        async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
            let item: WorkItem = serde_json::from_value(input)?;
            let first = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(item.message_id.clone());
                seen.len() == 1
            };
            self.started.notify_one();
            if first && let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            if item.message_id.starts_with("fail") {
                return Err(ActivityError::Retryable("parser offline".into()));
            }
            let count = item
                .message_id
                .chars()
                .filter_map(|c| c.to_digit(10))
                .next()
                .unwrap_or(0);
            let items = (0..count)
                .map(|n| LineItem {
                    description: format!("item {n}"),
                    quantity: 1,
                    unit: None,
                })
                .collect();
            Ok(serde_json::to_value(ParseOutcome::new(item.thread_id, item.message_id, items))?)
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Activity for Recorder {
        fn name(&self) -> &str {
            RECORD_TRIAGE
        }

        async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
            self.calls.lock().unwrap().push(input.clone());
            Ok(input)
        }
    }

    impl Recorder {
        fn statuses(&self) -> Vec<(String, String)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| {
                    (
                        c["message_id"].as_str().unwrap_or_default().to_string(),
                        c["status"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        }
    }

    struct KeepGoing;

    impl OutcomeStrategy for KeepGoing {
        fn route(&self, _: &ParseOutcome) -> Option<OutcomeAction> {
            Some(OutcomeAction::Continue)
        }
    }

    fn config() -> ConversationConfig {
        ConversationConfig {
            idle_interval: Duration::from_millis(20),
            parse_timeout: Duration::from_secs(1),
            parse_retry: RetryPolicy::fixed(Duration::from_millis(1), 2),
            ..ConversationConfig::default()
        }
    }

    fn runtime(
        strategy: Arc<dyn OutcomeStrategy>,
        parse: Arc<ScriptedParse>,
        recorder: Arc<Recorder>,
    ) -> Arc<WorkflowRuntime> {
        WorkflowRuntime::builder()
            .workflow(Arc::new(ConversationWorkflow::new(config(), strategy)))
            .workflow(Arc::new(crate::conversation::triage::TriageWorkflow::default()))
            .activity(parse)
            .activity(recorder)
            .build()
    }

    fn new_message(message_id: &str) -> StartOptions {
        StartOptions::new(conversation_workflow_id("t-1"), "test")
            .with_input(json!({"thread_id": "t-1"}))
            .with_signal(Signal::new(
                NEW_MESSAGE,
                json!({"thread_id": "t-1", "message_id": message_id}),
            ))
    }

    fn complete() -> StartOptions {
        StartOptions::new(conversation_workflow_id("t-1"), "test")
            .with_input(json!({"thread_id": "t-1"}))
            .with_signal(Signal::new(COMPLETE_THREAD, json!({"thread_id": "t-1"})))
    }

    #[tokio::test]
    async fn drains_fifo_and_waits_for_queue_before_completing() {
        let parse = Arc::new(ScriptedParse::default());
        let rt = runtime(Arc::new(KeepGoing), parse.clone(), Arc::new(Recorder::default()));

        for id in ["m0-a", "m0-b", "m0-c"] {
            rt.start_or_signal(RFQ_CONVERSATION, new_message(id)).await.unwrap();
        }
        rt.start_or_signal(RFQ_CONVERSATION, complete()).await.unwrap();

        let result = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap();
        assert_eq!(result["processed"], 3);
        assert_eq!(result["signals"], 4);
        assert_eq!(*parse.seen.lock().unwrap(), vec!["m0-a", "m0-b", "m0-c"]);
    }

    #[tokio::test]
    async fn concurrent_signals_are_all_processed_in_arrival_order() {
        let parse = Arc::new(ScriptedParse::default());
        let rt = runtime(Arc::new(KeepGoing), parse.clone(), Arc::new(Recorder::default()));

        // Serialised per sender; each task sends in order.
        let mut tasks = Vec::new();
        for sender in 0..4 {
            let rt = rt.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..5 {
                    rt.start_or_signal(RFQ_CONVERSATION, new_message(&format!("m0-{sender}-{n}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        rt.start_or_signal(RFQ_CONVERSATION, complete()).await.unwrap();

        let result = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap();
        assert_eq!(result["processed"], 20);

        let seen = parse.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 20);
        for sender in 0..4 {
            let own: Vec<_> = seen
                .iter()
                .filter(|id| id.starts_with(&format!("m0-{sender}-")))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..5).map(|n| format!("m0-{sender}-{n}")).collect();
            assert_eq!(own, expected);
        }
    }

    #[tokio::test]
    async fn single_item_dispatches_triage_and_terminates() {
        let parse = Arc::new(ScriptedParse::default());
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(Arc::new(SingleItemTriage), parse, recorder.clone());

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m1")).await.unwrap();

        let result = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap();
        assert_eq!(result["dispatched_for"], "m1");

        let triage = rt.result("rfq-triage-t-1").await.unwrap().unwrap();
        assert_eq!(triage["message_id"], "m1");

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["status"], "triaged");
    }

    #[tokio::test]
    async fn unhandled_outcome_fails_closed() {
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(
            Arc::new(SingleItemTriage),
            Arc::new(ScriptedParse::default()),
            recorder.clone(),
        );

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m2")).await.unwrap();

        let err = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnhandledOutcome { ref thread_id, .. } if thread_id == "t-1"));
        assert!(rt.result("rfq-triage-t-1").await.is_none());

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls[0]["status"], "rejected");
    }

    #[tokio::test]
    async fn missing_parser_terminates_with_activity_error() {
        let rt = WorkflowRuntime::builder()
            .workflow(Arc::new(ConversationWorkflow::new(config(), Arc::new(KeepGoing))))
            .build();

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m0")).await.unwrap();
        let err = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotRegistered { kind: "activity", .. }));
    }

    #[tokio::test]
    async fn idle_instance_stays_alive_until_cancelled() {
        let rt = runtime(
            Arc::new(KeepGoing),
            Arc::new(ScriptedParse::default()),
            Arc::new(Recorder::default()),
        );
        let id = conversation_workflow_id("t-1");

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rt.is_running(&id).await);

        rt.cancel(&id).await.unwrap();
        let err = rt.wait_for_completion(&id).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn signals_during_a_parse_queue_behind_it() {
        let gate = Arc::new(Notify::new());
        let parse = Arc::new(ScriptedParse::gated(gate.clone()));
        let rt = runtime(Arc::new(KeepGoing), parse.clone(), Arc::new(Recorder::default()));

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m0-a")).await.unwrap();
        parse.started.notified().await;

        // m0-a is still being parsed while the rest arrives.
        for id in ["m0-b", "m0-c"] {
            rt.start_or_signal(RFQ_CONVERSATION, new_message(id)).await.unwrap();
        }
        rt.start_or_signal(RFQ_CONVERSATION, complete()).await.unwrap();
        assert!(rt.is_running(&conversation_workflow_id("t-1")).await);
        assert_eq!(parse.seen.lock().unwrap().len(), 1);

        gate.notify_one();
        let result = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap();
        assert_eq!(result["processed"], 3);
        assert_eq!(*parse.seen.lock().unwrap(), vec!["m0-a", "m0-b", "m0-c"]);
    }

    #[tokio::test]
    async fn terminal_dispatch_returns_queued_messages_to_pending() {
        let gate = Arc::new(Notify::new());
        let parse = Arc::new(ScriptedParse::gated(gate.clone()));
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(Arc::new(SingleItemTriage), parse.clone(), recorder.clone());

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m1")).await.unwrap();
        parse.started.notified().await;
        rt.start_or_signal(RFQ_CONVERSATION, new_message("m1-later")).await.unwrap();
        gate.notify_one();

        let result = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap();
        assert_eq!(result["dispatched_for"], "m1");
        assert_eq!(
            recorder.statuses(),
            vec![
                ("m1".to_string(), "triaged".to_string()),
                ("m1-later".to_string(), "pending".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_instance_returns_queued_messages_to_pending() {
        let gate = Arc::new(Notify::new());
        let parse = Arc::new(ScriptedParse::gated(gate.clone()));
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(Arc::new(SingleItemTriage), parse.clone(), recorder.clone());

        rt.start_or_signal(RFQ_CONVERSATION, new_message("m2")).await.unwrap();
        parse.started.notified().await;
        rt.start_or_signal(RFQ_CONVERSATION, new_message("m1-next")).await.unwrap();
        gate.notify_one();

        let err = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnhandledOutcome { .. }));
        assert_eq!(
            recorder.statuses(),
            vec![
                ("m2".to_string(), "rejected".to_string()),
                ("m1-next".to_string(), "pending".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_parse_returns_the_message_to_pending() {
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(
            Arc::new(KeepGoing),
            Arc::new(ScriptedParse::default()),
            recorder.clone(),
        );

        rt.start_or_signal(RFQ_CONVERSATION, new_message("fail-1")).await.unwrap();
        let err = rt
            .wait_for_completion(&conversation_workflow_id("t-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ActivityFailed { attempts: 2, .. }));
        assert_eq!(
            recorder.statuses(),
            vec![("fail-1".to_string(), "pending".to_string())]
        );
    }
}
