//! Singleton polling workflow feeding conversations from the message store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::PollingConfig;
use crate::conversation::activities::{FETCH_NEW_ITEMS, FetchedItems, RECORD_TRIAGE, TriageRecord};
use crate::conversation::state::WorkItem;
use crate::conversation::workflow::RFQ_CONVERSATION;
use crate::conversation::{complete_thread_start, new_message_start};
use crate::durable::activity::ActivityOptions;
use crate::durable::context::WorkflowContext;
use crate::durable::runtime::{StartOptions, Workflow, WorkflowResult, WorkflowRuntime};
use crate::error::WorkflowError;
use crate::store::traits::MessageStatus;

pub const RFQ_INBOX_POLLER: &str = "rfq_inbox_poller";

/// Fetches new items on an interval and forwards them to their conversations.
pub struct PollingWorkflow {
    interval: std::time::Duration,
    conversation_queue: String,
    fetch_options: ActivityOptions,
}

impl PollingWorkflow {
    pub fn new(config: &PollingConfig, conversation_queue: impl Into<String>) -> Self {
        Self {
            interval: config.interval,
            conversation_queue: conversation_queue.into(),
            fetch_options: ActivityOptions::default(),
        }
    }

    /// Forward a fetched batch. Only cancellation stops the poller; an item
    /// that cannot be forwarded goes back to `pending` for the next tick.
    async fn forward(&self, ctx: &WorkflowContext, fetched: FetchedItems) -> Result<(), WorkflowError> {
        for item in &fetched.items {
            match self.send(ctx, item).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    error!(
                        thread_id = %item.thread_id,
                        message_id = %item.message_id,
                        error = %e,
                        "Failed to forward message"
                    );
                    self.release(ctx, item).await?;
                }
            }
        }
        for thread_id in &fetched.completed_thread_ids {
            let sent = match complete_thread_start(thread_id, &self.conversation_queue) {
                Ok(options) => ctx.signal_with_start(RFQ_CONVERSATION, options).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => debug!(thread_id = %thread_id, "Forwarded thread completion"),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => error!(thread_id = %thread_id, error = %e, "Failed to forward thread completion"),
            }
        }
        Ok(())
    }

    async fn send(&self, ctx: &WorkflowContext, item: &WorkItem) -> Result<(), WorkflowError> {
        let options = new_message_start(item, &self.conversation_queue)?;
        let outcome = ctx.signal_with_start(RFQ_CONVERSATION, options).await?;
        debug!(
            thread_id = %item.thread_id,
            message_id = %item.message_id,
            outcome = ?outcome,
            "Forwarded new message"
        );
        Ok(())
    }

    async fn release(&self, ctx: &WorkflowContext, item: &WorkItem) -> Result<(), WorkflowError> {
        let record = TriageRecord {
            message_id: item.message_id.clone(),
            status: MessageStatus::Pending,
        };
        match ctx
            .execute_activity(RECORD_TRIAGE, serde_json::to_value(&record)?, &self.fetch_options)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(message_id = %item.message_id, error = %e, "Failed to return message to pending");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Workflow for PollingWorkflow {
    fn name(&self) -> &str {
        RFQ_INBOX_POLLER
    }

    async fn run(&self, ctx: &mut WorkflowContext, _input: serde_json::Value) -> WorkflowResult {
        info!(workflow_id = %ctx.workflow_id(), interval = ?self.interval, "Inbox poller started");

        loop {
            match ctx
                .execute_activity(FETCH_NEW_ITEMS, json!({}), &self.fetch_options)
                .await
            {
                Ok(output) => {
                    let fetched: FetchedItems = serde_json::from_value(output)?;
                    if !fetched.items.is_empty() || !fetched.completed_thread_ids.is_empty() {
                        info!(
                            items = fetched.items.len(),
                            completed = fetched.completed_thread_ids.len(),
                            "Poll fetched work"
                        );
                    }
                    self.forward(ctx, fetched).await?;
                }
                Err(e) if e.is_cancellation() => return Err(e),
                // A failed poll is retried on the next tick.
                Err(e) => error!(error = %e, "Poll failed"),
            }

            ctx.sleep(self.interval).await?;
        }
    }
}

/// Start the singleton poller. An already running poller is left alone.
pub async fn start_polling(runtime: &Arc<WorkflowRuntime>, config: &PollingConfig) -> Result<(), WorkflowError> {
    let options = StartOptions::new(&config.workflow_id, &config.task_queue);
    match runtime.start(RFQ_INBOX_POLLER, options).await {
        Ok(()) => {
            info!(workflow_id = %config.workflow_id, "Inbox poller scheduled");
            Ok(())
        }
        Err(WorkflowError::AlreadyStarted { workflow_id }) => {
            info!(workflow_id = %workflow_id, "Inbox poller already running");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::config::ConversationConfig;
    use crate::conversation::activities::PARSE_THREAD;
    use crate::conversation::outcome::{OutcomeAction, OutcomeStrategy, ParseOutcome};
    use crate::conversation::workflow::{ConversationWorkflow, conversation_workflow_id};
    use crate::durable::activity::Activity;
    use crate::error::ActivityError;

    /// Hands out one scripted batch per call.
    struct ScriptedFetch {
        batches: Mutex<Vec<FetchedItems>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Activity for ScriptedFetch {
        fn name(&self) -> &str {
            FETCH_NEW_ITEMS
        }

        async fn execute(&self, _input: Value) -> Result<Value, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut batches = self.batches.lock().unwrap();
                if batches.is_empty() {
                    FetchedItems::default()
                } else {
                    batches.remove(0)
                }
            };
            Ok(serde_json::to_value(next)?)
        }
    }

    #[derive(Default)]
    struct EmptyParse {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Activity for EmptyParse {
        fn name(&self) -> &str {
            PARSE_THREAD
        }

        async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
            let item: WorkItem = serde_json::from_value(input)?;
            self.seen.lock().unwrap().push(item.message_id.clone());
            Ok(serde_json::to_value(ParseOutcome::new(item.thread_id, item.message_id, vec![]))?)
        }
    }

    struct KeepGoing;

    impl OutcomeStrategy for KeepGoing {
        fn route(&self, _: &ParseOutcome) -> Option<OutcomeAction> {
            Some(OutcomeAction::Continue)
        }
    }

    fn polling_config() -> PollingConfig {
        PollingConfig {
            interval: Duration::from_millis(20),
            ..PollingConfig::default()
        }
    }

    #[tokio::test]
    async fn forwards_items_and_completions_to_conversations() {
        let fetch = Arc::new(ScriptedFetch {
            batches: Mutex::new(vec![
                FetchedItems {
                    items: vec![WorkItem::new("t-1", "m-1"), WorkItem::new("t-2", "m-2")],
                    completed_thread_ids: vec![],
                },
                FetchedItems {
                    items: vec![WorkItem::new("t-1", "m-3")],
                    completed_thread_ids: vec!["t-1".into(), "t-2".into()],
                },
            ]),
            calls: AtomicU32::new(0),
        });
        let parse = Arc::new(EmptyParse::default());
        let conversation = ConversationConfig {
            idle_interval: Duration::from_millis(10),
            ..ConversationConfig::default()
        };
        let rt = WorkflowRuntime::builder()
            .workflow(Arc::new(PollingWorkflow::new(&polling_config(), "test")))
            .workflow(Arc::new(ConversationWorkflow::new(conversation, Arc::new(KeepGoing))))
            .activity(fetch.clone())
            .activity(parse.clone())
            .build();

        start_polling(&rt, &polling_config()).await.unwrap();

        // The conversation may not exist yet on the first checks.
        let mut result = None;
        for _ in 0..200 {
            if let Some(done) = rt.result(&conversation_workflow_id("t-1")).await {
                result = Some(done.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let result = result.expect("conversation t-1 never completed");
        assert_eq!(result["processed"], 2);

        let seen = parse.seen.lock().unwrap().clone();
        let t1: Vec<_> = seen.iter().filter(|m| *m != "m-2").cloned().collect();
        assert_eq!(t1, vec!["m-1", "m-3"]);
        assert!(fetch.calls.load(Ordering::SeqCst) >= 2);
        assert!(rt.is_running("rfq-inbox-poller").await);

        rt.shutdown();
    }

    #[tokio::test]
    async fn start_polling_is_idempotent() {
        let fetch = Arc::new(ScriptedFetch {
            batches: Mutex::new(vec![]),
            calls: AtomicU32::new(0),
        });
        let rt = WorkflowRuntime::builder()
            .workflow(Arc::new(PollingWorkflow::new(&polling_config(), "test")))
            .activity(fetch)
            .build();

        start_polling(&rt, &polling_config()).await.unwrap();
        start_polling(&rt, &polling_config()).await.unwrap();
        assert_eq!(rt.running_count().await, 1);

        rt.cancel("rfq-inbox-poller").await.unwrap();
        assert!(rt.wait_for_completion("rfq-inbox-poller").await.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn failed_poll_does_not_stop_the_loop() {
        struct Failing(AtomicU32);

        #[async_trait]
        impl Activity for Failing {
            fn name(&self) -> &str {
                FETCH_NEW_ITEMS
            }

            async fn execute(&self, _input: Value) -> Result<Value, ActivityError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(ActivityError::NonRetryable("store offline".into()))
            }
        }

        let failing = Arc::new(Failing(AtomicU32::new(0)));
        let rt = WorkflowRuntime::builder()
            .workflow(Arc::new(PollingWorkflow::new(&polling_config(), "test")))
            .activity(failing.clone())
            .build();

        start_polling(&rt, &polling_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(failing.0.load(Ordering::SeqCst) >= 2);
        assert!(rt.is_running("rfq-inbox-poller").await);
        rt.shutdown();
    }

    #[tokio::test]
    async fn unforwardable_items_return_to_pending_and_polling_continues() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<Value>>);

        #[async_trait]
        impl Activity for Recorder {
            fn name(&self) -> &str {
                RECORD_TRIAGE
            }

            async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
                self.0.lock().unwrap().push(input.clone());
                Ok(input)
            }
        }

        let fetch = Arc::new(ScriptedFetch {
            batches: Mutex::new(vec![FetchedItems {
                items: vec![WorkItem::new("t-1", "m-1")],
                completed_thread_ids: vec![],
            }]),
            calls: AtomicU32::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        // No conversation workflow registered: every forward fails.
        let rt = WorkflowRuntime::builder()
            .workflow(Arc::new(PollingWorkflow::new(&polling_config(), "test")))
            .activity(fetch.clone())
            .activity(recorder.clone())
            .build();

        start_polling(&rt, &polling_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = recorder.0.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["message_id"], "m-1");
        assert_eq!(calls[0]["status"], "pending");
        assert!(fetch.calls.load(Ordering::SeqCst) >= 2);
        assert!(rt.is_running("rfq-inbox-poller").await);
        rt.shutdown();
    }
}
