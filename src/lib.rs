//! RFQ Intake: reliable event and conversation processing for inbound
//! request-for-quote email threads.

pub mod config;
pub mod conversation;
pub mod durable;
pub mod error;
pub mod inbox;
pub mod pipeline;
pub mod store;
