//! Durable per-thread conversations and the workflows around them.

pub mod activities;
pub mod outcome;
pub mod polling;
pub mod state;
pub mod triage;
pub mod workflow;

pub use activities::{FetchNewItemsActivity, ParseThreadActivity, RecordTriageActivity, ThreadParser};
pub use outcome::{LineItem, OutcomeAction, OutcomeStrategy, ParseOutcome, SingleItemTriage, StrategyChain};
pub use polling::{PollingWorkflow, start_polling};
pub use state::{ConversationState, WorkItem};
pub use triage::TriageWorkflow;
pub use workflow::{ConversationWorkflow, RFQ_CONVERSATION, conversation_workflow_id};

use serde_json::json;

use crate::durable::runtime::{Signal, StartOptions};
use crate::error::WorkflowError;

fn start_for(thread_id: &str, task_queue: &str, signal: Signal) -> StartOptions {
    StartOptions::new(conversation_workflow_id(thread_id), task_queue)
        .with_input(json!({ "thread_id": thread_id }))
        .with_signal(signal)
}

/// Start-or-signal options delivering `new-message` for `item`.
pub fn new_message_start(item: &WorkItem, task_queue: &str) -> Result<StartOptions, WorkflowError> {
    let signal = Signal::new(state::NEW_MESSAGE, serde_json::to_value(item)?);
    Ok(start_for(&item.thread_id, task_queue, signal))
}

/// Start-or-signal options delivering `complete-thread`.
pub fn complete_thread_start(thread_id: &str, task_queue: &str) -> Result<StartOptions, WorkflowError> {
    let payload = state::CompleteThread {
        thread_id: thread_id.to_string(),
    };
    let signal = Signal::new(state::COMPLETE_THREAD, serde_json::to_value(payload)?);
    Ok(start_for(thread_id, task_queue, signal))
}
