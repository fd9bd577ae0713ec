//! Inbound pipeline.
//!
//! Every broker delivery flows through:
//! 1. `spawn_consumer`: pulls deliveries and reports ack/redeliver
//! 2. `InboundHandler::handle`: ingestion guard, message storage, start-or-signal
//! 3. the per-thread conversation workflow, which parses with `RulesParser`
//!    (or any other `ThreadParser`)

pub mod consumer;
pub mod handler;
pub mod rules;
pub mod types;

pub use consumer::{classify, spawn_consumer};
pub use handler::{HandledEvent, InboundHandler};
pub use rules::RulesParser;
pub use types::{Delivery, DeliveryReport, DeliveryResult, InboundEvent};
