//! Shared types for the inbound pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::traits::NewMessage;

// ── Inbound events ──────────────────────────────────────────────────

/// A channel event as published on the broker.
///
/// `id` is the channel-native id used for deduplication; it is optional
/// because some channels do not provide one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A new message in a thread.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Source channel: "gmail", "outlook", etc.
        channel: String,
        thread_id: String,
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        content: String,
        #[serde(default = "Utc::now")]
        received_at: DateTime<Utc>,
    },
    /// The channel reports that no further messages will arrive.
    ThreadCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        channel: String,
        thread_id: String,
    },
}

impl InboundEvent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ThreadCompleted { .. } => "thread_completed",
        }
    }

    /// Channel-assigned event id, when the channel provides one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. } | Self::ThreadCompleted { id, .. } => id.as_deref(),
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::Message { channel, .. } | Self::ThreadCompleted { channel, .. } => channel,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            Self::Message { thread_id, .. } | Self::ThreadCompleted { thread_id, .. } => thread_id,
        }
    }

    /// Storage form of a `Message` event. `external_id` is the id the
    /// ingestion guard settled on.
    pub fn to_new_message(&self, external_id: &str) -> Option<NewMessage> {
        match self {
            Self::Message {
                channel,
                thread_id,
                sender,
                subject,
                content,
                received_at,
                ..
            } => Some(NewMessage {
                external_id: external_id.to_string(),
                channel: channel.clone(),
                thread_id: thread_id.clone(),
                sender: sender.clone(),
                subject: subject.clone(),
                content: content.clone(),
                received_at: *received_at,
            }),
            Self::ThreadCompleted { .. } => None,
        }
    }
}

// ── Broker boundary ─────────────────────────────────────────────────

/// One delivery from the broker. The same payload may arrive many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub topic: String,
    pub payload: serde_json::Value,
    /// 1 for the first delivery; the broker increments on redelivery.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            attempt: 1,
        }
    }
}

/// What the consumer tells the broker about a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryResult {
    /// Handled; drop it.
    Ack,
    /// Already handled earlier; drop it.
    Duplicate { message_id: String },
    /// Not handled yet; deliver again later.
    Redeliver { reason: String },
    /// Can never be handled (malformed payload); dead-letter it.
    Reject { reason: String },
}

impl DeliveryResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Duplicate { .. } => "duplicate",
            Self::Redeliver { .. } => "redeliver",
            Self::Reject { .. } => "reject",
        }
    }

    /// Whether the broker may forget the delivery.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ack | Self::Duplicate { .. } | Self::Reject { .. })
    }
}

/// A delivery paired with its result, sent back to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivery: Delivery,
    pub result: DeliveryResult,
}
