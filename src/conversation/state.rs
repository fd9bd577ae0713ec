//! Per-thread conversation state, mutated only by applying signals.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::durable::runtime::Signal;

/// Signal appending a message to a thread's work queue.
pub const NEW_MESSAGE: &str = "new-message";

/// Signal marking a thread as complete once its queue drains.
pub const COMPLETE_THREAD: &str = "complete-thread";

/// One unit of pending work: a message to parse within its thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub thread_id: String,
    pub message_id: String,
}

impl WorkItem {
    pub fn new(thread_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Payload of `complete-thread`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteThread {
    pub thread_id: String,
}

/// Where the control loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    /// Queue empty, thread still open.
    AwaitingWork,
    /// Items queued.
    Draining,
    /// Thread complete and queue empty; the loop exits.
    Terminated,
}

/// Queue, completion flag, and signal counter for one thread.
#[derive(Debug, Clone)]
pub struct ConversationState {
    thread_id: String,
    queue: VecDeque<WorkItem>,
    is_done: bool,
    counter: u64,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            queue: VecDeque::new(),
            is_done: false,
            counter: 0,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Signals received so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn phase(&self) -> ConversationPhase {
        match (self.queue.is_empty(), self.is_done) {
            (false, _) => ConversationPhase::Draining,
            (true, false) => ConversationPhase::AwaitingWork,
            (true, true) => ConversationPhase::Terminated,
        }
    }

    /// Apply one signal. Unknown or malformed signals are logged and dropped.
    pub fn apply(&mut self, signal: &Signal) {
        match signal.name.as_str() {
            NEW_MESSAGE => match serde_json::from_value::<WorkItem>(signal.payload.clone()) {
                Ok(item) => {
                    if item.thread_id != self.thread_id {
                        warn!(
                            thread_id = %self.thread_id,
                            signal_thread = %item.thread_id,
                            "new-message addressed to another thread"
                        );
                    }
                    self.counter += 1;
                    debug!(
                        thread_id = %self.thread_id,
                        message_id = %item.message_id,
                        queued = self.queue.len() + 1,
                        "Message queued"
                    );
                    self.queue.push_back(item);
                }
                Err(e) => error!(thread_id = %self.thread_id, error = %e, "Malformed new-message signal"),
            },
            COMPLETE_THREAD => {
                self.counter += 1;
                self.is_done = true;
                debug!(thread_id = %self.thread_id, queued = self.queue.len(), "Thread marked complete");
            }
            other => warn!(thread_id = %self.thread_id, signal = other, "Ignoring unknown signal"),
        }
    }

    /// Take the oldest queued item.
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.queue.pop_front()
    }

    /// Put an item back at the head of the queue.
    pub fn requeue(&mut self, item: WorkItem) {
        self.queue.push_front(item);
    }

    /// Remove every queued item, oldest first.
    pub fn take_queued(&mut self) -> Vec<WorkItem> {
        self.queue.drain(..).collect()
    }
}
