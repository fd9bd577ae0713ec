//! Parse outcomes and the strategies that route them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Workflow name of the triage child.
pub const RFQ_TRIAGE: &str = "rfq_triage";

/// One requested line in an RFQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Result of the `parse_thread` activity for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub thread_id: String,
    pub message_id: String,
    /// Number of distinct line items found.
    pub quantity: usize,
    pub items: Vec<LineItem>,
}

impl ParseOutcome {
    pub fn new(thread_id: impl Into<String>, message_id: impl Into<String>, items: Vec<LineItem>) -> Self {
        Self {
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            quantity: items.len(),
            items,
        }
    }

    /// Short form used in logs and `UnhandledOutcome` errors.
    pub fn summary(&self) -> String {
        format!("message {} with {} line item(s)", self.message_id, self.quantity)
    }
}

/// What the control loop does with a parse outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeAction {
    /// Run a child workflow and wait for it. With `terminal` set the
    /// conversation ends once the child returns.
    DispatchChild {
        workflow: String,
        id: String,
        input: serde_json::Value,
        terminal: bool,
    },
    /// Nothing to dispatch; keep draining.
    Continue,
}

/// Decides the next step for a parse outcome.
///
/// `None` means the outcome is not handled; the conversation fails closed.
pub trait OutcomeStrategy: Send + Sync {
    fn route(&self, outcome: &ParseOutcome) -> Option<OutcomeAction>;
}

/// Dispatches `rfq_triage` for single-item requests and ends the conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleItemTriage;

impl OutcomeStrategy for SingleItemTriage {
    fn route(&self, outcome: &ParseOutcome) -> Option<OutcomeAction> {
        if outcome.quantity != 1 {
            return None;
        }
        let input = serde_json::to_value(outcome).ok()?;
        Some(OutcomeAction::DispatchChild {
            workflow: RFQ_TRIAGE.to_string(),
            id: triage_workflow_id(&outcome.thread_id),
            input,
            terminal: true,
        })
    }
}

/// Id of the triage child for a thread.
pub fn triage_workflow_id(thread_id: &str) -> String {
    format!("rfq-triage-{thread_id}")
}

/// Tries each strategy in order; the first that handles the outcome wins.
#[derive(Clone, Default)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn OutcomeStrategy>>,
}

impl StrategyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: Arc<dyn OutcomeStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl OutcomeStrategy for StrategyChain {
    fn route(&self, outcome: &ParseOutcome) -> Option<OutcomeAction> {
        self.strategies.iter().find_map(|s| s.route(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(description: &str, quantity: u32) -> LineItem {
        LineItem {
            description: description.into(),
            quantity,
            unit: None,
        }
    }

    struct AlwaysContinue;

    impl OutcomeStrategy for AlwaysContinue {
        fn route(&self, _: &ParseOutcome) -> Option<OutcomeAction> {
            Some(OutcomeAction::Continue)
        }
    }

    #[test]
    fn single_item_dispatches_triage() {
        let outcome = ParseOutcome::new("t-9", "m-1", vec![item("M8 bolts", 500)]);
        let Some(OutcomeAction::DispatchChild {
            workflow,
            id,
            input,
            terminal,
        }) = SingleItemTriage.route(&outcome)
        else {
            panic!("expected dispatch");
        };
        assert_eq!(workflow, "rfq_triage");
        assert_eq!(id, "rfq-triage-t-9");
        assert!(terminal);
        assert_eq!(input["quantity"], 1);
        assert_eq!(input["items"][0]["quantity"], 500);
    }

    #[test]
    fn other_quantities_are_unhandled() {
        let empty = ParseOutcome::new("t", "m", vec![]);
        let many = ParseOutcome::new("t", "m", vec![item("a", 1), item("b", 2)]);
        assert!(SingleItemTriage.route(&empty).is_none());
        assert!(SingleItemTriage.route(&many).is_none());
    }

    #[test]
    fn chain_takes_first_match() {
        let chain = StrategyChain::new()
            .with(Arc::new(SingleItemTriage))
            .with(Arc::new(AlwaysContinue));
        assert_eq!(chain.len(), 2);

        let many = ParseOutcome::new("t", "m", vec![item("a", 1), item("b", 2)]);
        assert_eq!(chain.route(&many), Some(OutcomeAction::Continue));

        let one = ParseOutcome::new("t", "m", vec![item("a", 1)]);
        assert!(matches!(chain.route(&one), Some(OutcomeAction::DispatchChild { .. })));

        assert!(StrategyChain::new().route(&one).is_none());
    }
}
