//! `rfq_triage` child workflow.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::conversation::activities::{RECORD_TRIAGE, TriageRecord};
use crate::conversation::outcome::{ParseOutcome, RFQ_TRIAGE};
use crate::durable::activity::ActivityOptions;
use crate::durable::context::WorkflowContext;
use crate::durable::runtime::{Workflow, WorkflowResult};
use crate::store::traits::MessageStatus;

/// Marks a parsed single-item request as triaged.
#[derive(Debug, Default)]
pub struct TriageWorkflow {
    options: ActivityOptions,
}

impl TriageWorkflow {
    pub fn new(options: ActivityOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Workflow for TriageWorkflow {
    fn name(&self) -> &str {
        RFQ_TRIAGE
    }

    async fn run(&self, ctx: &mut WorkflowContext, input: serde_json::Value) -> WorkflowResult {
        let outcome: ParseOutcome = serde_json::from_value(input)?;

        let record = TriageRecord {
            message_id: outcome.message_id.clone(),
            status: MessageStatus::Triaged,
        };
        ctx.execute_activity(RECORD_TRIAGE, serde_json::to_value(&record)?, &self.options)
            .await?;

        info!(
            workflow_id = %ctx.workflow_id(),
            thread_id = %outcome.thread_id,
            message_id = %outcome.message_id,
            "RFQ triaged"
        );
        Ok(json!({
            "thread_id": outcome.thread_id,
            "message_id": outcome.message_id,
            "items": outcome.items,
        }))
    }
}
