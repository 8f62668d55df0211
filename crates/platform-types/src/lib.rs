//! Shared wire/storage types for the command bus, outbox relay and process
//! manager.
//!
//! Every other crate in the workspace depends on this one and on nothing
//! else in the workspace for its type vocabulary — it has no IO, no
//! database driver, no broker client. Keeping it leaf-level means the data
//! model (spec §3) can be unit tested without a Postgres instance.

pub mod command;
pub mod dlq;
pub mod envelope;
pub mod inbox;
pub mod outbox;
pub mod process;

pub use command::{Command, CommandStatus, NewCommand};
pub use dlq::{DlqRecord, NewDlqRecord};
pub use envelope::{Envelope, EnvelopeHeaders, MessageType};
pub use inbox::InboxRecord;
pub use outbox::{
    exponential_backoff, ClaimedOutboxRow, NewOutboxEntry, OutboxCategory, OutboxEntry,
    OutboxStatus,
};
pub use process::{
    ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus, PARALLEL_BRANCHES_KEY,
    TERMINAL_STEP,
};
