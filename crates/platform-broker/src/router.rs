//! `BrokerRouter` — the single choke point through which the Relay (C5)
//! publishes claimed outbox rows, generalizing the teacher's `BrokerGateway`
//! single-choke-point pattern (`mqk-execution/src/gateway.rs`) from a
//! three-gate order-submit path to a three-way category router.
//!
//! Unlike the teacher's gateway there are no gate verdicts to enforce here —
//! the command bus and process manager are the policy layer; by the time a
//! row reaches the relay it has already been admitted. `BrokerRouter`'s only
//! job is picking the right port for `category` and shaping the call.

use std::sync::Arc;

use platform_types::{OutboxCategory, OutboxEntry};

use crate::ports::{CommandQueuePort, EventsPort, ReplyQueuePort};

pub struct BrokerRouter<Q, R, E>
where
    Q: CommandQueuePort,
    R: ReplyQueuePort,
    E: EventsPort,
{
    command_queue: Arc<Q>,
    reply_queue: Arc<R>,
    events: Arc<E>,
}

impl<Q, R, E> BrokerRouter<Q, R, E>
where
    Q: CommandQueuePort,
    R: ReplyQueuePort,
    E: EventsPort,
{
    pub fn new(command_queue: Arc<Q>, reply_queue: Arc<R>, events: Arc<E>) -> Self {
        Self {
            command_queue,
            reply_queue,
            events,
        }
    }

    /// Route a claimed outbox row to the port matching its category.
    pub async fn publish(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        let headers = &entry.headers;
        match entry.category {
            OutboxCategory::Command => {
                self.command_queue
                    .send(&entry.topic, &entry.payload, headers)
                    .await
            }
            OutboxCategory::Reply => {
                self.reply_queue
                    .send(&entry.topic, &entry.payload, headers)
                    .await
            }
            OutboxCategory::Event => {
                self.events
                    .publish(&entry.topic, entry.key.as_deref(), &entry.payload, headers)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn sample_entry(category: OutboxCategory, topic: &str) -> OutboxEntry {
        OutboxEntry {
            id: 1,
            category,
            topic: topic.to_string(),
            key: None,
            r#type: "OrderPlaced".to_string(),
            payload: serde_json::json!({}),
            headers: Default::default(),
            status: platform_types::OutboxStatus::Claimed,
            attempts: 0,
            next_at: None,
            claimed_by: Some("relay-1".to_string()),
            claimed_at: None,
            created_at: chrono::Utc::now(),
            published_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn publish_routes_by_category() {
        let broker = Arc::new(MemoryBroker::new());
        let router = BrokerRouter::new(broker.clone(), broker.clone(), broker.clone());

        let mut commands_rx = broker.subscribe_commands("orders");
        let mut events_rx = broker.subscribe_events("orders");

        router
            .publish(&sample_entry(OutboxCategory::Command, "orders"))
            .await
            .unwrap();
        assert!(commands_rx.try_recv().is_ok());
        assert!(events_rx.try_recv().is_err());

        router
            .publish(&sample_entry(OutboxCategory::Event, "orders"))
            .await
            .unwrap();
        assert!(events_rx.try_recv().is_ok());
    }
}
