//! Inbox-guarded consumer (spec §4.6): the boundary every inbound command
//! and reply message crosses exactly once, deduplicated against redelivery
//! and classified between retry and dead-letter on failure.

pub mod classifier;
pub mod consumer;
pub mod reaper;
pub mod wire;

pub use classifier::TransientClassifier;
pub use consumer::{Consumer, ConsumeOutcome, ConsumerConfig, DEFAULT_REPLY_TOPIC};
pub use reaper::ReaperWorker;
pub use wire::decode_command_envelope;
