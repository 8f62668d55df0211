//! In-process broker: the only concrete implementation of the broker ports
//! this workspace ships (spec §1 excludes real broker client libraries).
//!
//! Grounded in the teacher's `mqk-broker-paper` — deterministic, no external
//! IO, no randomness — generalized from a fixed order-submit/cancel/replace
//! API to arbitrary topic-addressed command/reply/event delivery backed by
//! `tokio::sync::broadcast`. A topic behaves like a real broker topic: a
//! subscriber only receives messages sent after it subscribes, not a replay
//! of history — callers that need delivery guarantees rely on outbox/inbox,
//! exactly as spec §1 intends this port to be a thin, replaceable transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::ports::{CommandQueuePort, EventsPort, FastPathPort, ReplyQueuePort};

const TOPIC_CAPACITY: usize = 1024;

/// A message delivered on a command/reply/event topic.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

#[derive(Default)]
struct TopicTable {
    topics: Mutex<HashMap<String, broadcast::Sender<DeliveredMessage>>>,
}

impl TopicTable {
    fn sender_for(&self, topic: &str) -> broadcast::Sender<DeliveredMessage> {
        let mut topics = self.topics.lock().expect("topic table lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &Value,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let tx = self.sender_for(topic);
        let msg = DeliveredMessage {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload: payload.clone(),
            headers: headers.clone(),
        };
        // No active receiver is not an error here: a real broker persists
        // the message for whoever subscribes next; this in-process stand-in
        // just means nobody is listening for it *yet* on this topic.
        let _ = tx.send(msg);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<DeliveredMessage> {
        self.sender_for(topic).subscribe()
    }
}

/// The single in-process broker instance shared by the daemon's default
/// wiring and by every scenario test. Cloning is cheap (internal `Arc`s).
#[derive(Clone)]
pub struct MemoryBroker {
    commands: std::sync::Arc<TopicTable>,
    replies: std::sync::Arc<TopicTable>,
    events: std::sync::Arc<TopicTable>,
    fastpath_tx: mpsc::UnboundedSender<i64>,
    fastpath_rx: std::sync::Arc<Mutex<Option<mpsc::UnboundedReceiver<i64>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (fastpath_tx, fastpath_rx) = mpsc::unbounded_channel();
        Self {
            commands: Default::default(),
            replies: Default::default(),
            events: Default::default(),
            fastpath_tx,
            fastpath_rx: std::sync::Arc::new(Mutex::new(Some(fastpath_rx))),
        }
    }

    pub fn subscribe_commands(&self, topic: &str) -> broadcast::Receiver<DeliveredMessage> {
        self.commands.subscribe(topic)
    }

    pub fn subscribe_replies(&self, topic: &str) -> broadcast::Receiver<DeliveredMessage> {
        self.replies.subscribe(topic)
    }

    pub fn subscribe_events(&self, topic: &str) -> broadcast::Receiver<DeliveredMessage> {
        self.events.subscribe(topic)
    }

    /// Hand ownership of the fast-path receiver to the worker pool that
    /// drains it (spec §4.5 `publishNow`). Only the first call gets a
    /// receiver — the fast path has exactly one logical consumer pool.
    pub fn take_fastpath_receiver(&self) -> Option<mpsc::UnboundedReceiver<i64>> {
        self.fastpath_rx.lock().expect("fastpath lock poisoned").take()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandQueuePort for MemoryBroker {
    async fn send(
        &self,
        topic: &str,
        payload: &Value,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.commands.send(topic, None, payload, headers)
    }
}

#[async_trait]
impl ReplyQueuePort for MemoryBroker {
    async fn send(
        &self,
        topic: &str,
        payload: &Value,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.replies.send(topic, None, payload, headers)
    }
}

#[async_trait]
impl EventsPort for MemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &Value,
        headers: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        self.events.send(topic, key, payload, headers)
    }
}

#[async_trait]
impl FastPathPort for MemoryBroker {
    async fn notify(&self, outbox_id: i64) -> anyhow::Result<()> {
        // Best-effort: a full/closed channel must never propagate as an
        // error to the caller (spec §4.2 "failures are swallowed").
        let _ = self.fastpath_tx.send(outbox_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_messages_sent_after_subscribing() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe_commands("orders");

        CommandQueuePort::send(&broker, "orders", &serde_json::json!({"a": 1}), &BTreeMap::new())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.payload, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn fastpath_receiver_can_only_be_taken_once() {
        let broker = MemoryBroker::new();
        assert!(broker.take_fastpath_receiver().is_some());
        assert!(broker.take_fastpath_receiver().is_none());
    }

    #[tokio::test]
    async fn fastpath_notify_never_errors_even_if_nobody_drains_it() {
        let broker = MemoryBroker::new();
        broker.take_fastpath_receiver();
        drop(broker.fastpath_tx.clone());
        assert!(FastPathPort::notify(&broker, 7).await.is_ok());
    }
}
