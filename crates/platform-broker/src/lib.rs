//! Broker ports (spec §4.2) and the one concrete transport this workspace
//! ships: an in-process broker grounded in the teacher's `mqk-broker-paper`.
//! Real broker client libraries are out of scope (spec §1) — anything
//! talking to Kafka/JMS/etc. implements [`ports::CommandQueuePort`] and
//! friends from outside this crate.

pub mod memory;
pub mod ports;
pub mod router;

pub use memory::MemoryBroker;
pub use ports::{CommandQueuePort, EventsPort, FastPathPort, ReplyQueuePort};
pub use router::BrokerRouter;
