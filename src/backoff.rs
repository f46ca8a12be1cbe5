// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Rescheduling
//!
//! A failed delivery is parked in a transient per-delay queue whose messages
//! expire after the delay and are dead-lettered back to the original routing
//! key. Delays grow by a factor of four from one second up to a ceiling, and
//! the current delay travels with the message in the `x-backoff-sec` header.

use crate::{
    broker::{Broker, Delivery},
    errors::{BusError, HandlerError},
    message::HeaderValue,
    queue::QueueDefinition,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Header carrying the current backoff delay of a message
pub const AMQP_HEADERS_BACKOFF: &str = "x-backoff-sec";
/// Delay of the first retry, in milliseconds
pub const INITIAL_BACKOFF_MS: i64 = 1000;
/// Growth factor applied on every further failure
pub const BACKOFF_MULTIPLIER: i64 = 4;
/// Upper bound of a single delay, in milliseconds
pub const MAX_BACKOFF_MS: i64 = 1_048_576;

/// Computes the delay that follows `current` (0 or negative when the message
/// never failed before).
pub fn next_delay_ms(current: i64) -> i64 {
    let next = if current > 0 {
        current.saturating_mul(BACKOFF_MULTIPLIER)
    } else {
        INITIAL_BACKOFF_MS
    };

    next.min(MAX_BACKOFF_MS)
}

/// Name of the transient queue holding messages of `queue` that failed on
/// `routing_key` and wait `delay_ms` before being redelivered.
pub fn backoff_queue_name(queue: &str, delay_ms: i64, routing_key: &str) -> String {
    format!("{}.backoff-{}s+{}", queue, delay_ms / 1000, routing_key)
}

/// What happened to a delivery handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffOutcome {
    /// The message now waits in `queue` for `delay_ms`
    Rescheduled { queue: String, delay_ms: i64 },
    /// The retry path failed and the delivery was negatively acknowledged
    Rejected(BusError),
}

/// Moves failed deliveries onto their backoff queue.
pub struct BackoffScheduler {
    broker: Arc<dyn Broker>,
    default_exchange: String,
}

impl BackoffScheduler {
    pub fn new(broker: Arc<dyn Broker>, default_exchange: &str) -> BackoffScheduler {
        BackoffScheduler {
            broker,
            default_exchange: default_exchange.to_owned(),
        }
    }

    /// Reroutes `delivery`, consumed from `queue`, through its next backoff
    /// queue and acknowledges it.
    ///
    /// If the backoff queue cannot be asserted or the message cannot be
    /// republished, the delivery is negatively acknowledged with requeue
    /// instead.
    pub async fn reschedule(
        &self,
        queue: &QueueDefinition,
        delivery: &Delivery,
        cause: Option<&HandlerError>,
    ) -> BackoffOutcome {
        let current = delivery
            .properties
            .headers
            .get(AMQP_HEADERS_BACKOFF)
            .and_then(HeaderValue::as_i64)
            .unwrap_or_default();
        let delay_ms = next_delay_ms(current);
        let backoff_queue = backoff_queue_name(&queue.name, delay_ms, &delivery.routing_key);

        match cause {
            Some(err) => error!(
                error = err.to_string(),
                queue = queue.name,
                routing_key = delivery.routing_key,
                "error when consuming message, the message will be requeued to {}",
                backoff_queue
            ),
            None => info!(
                queue = queue.name,
                routing_key = delivery.routing_key,
                "message was canceled, the message will be requeued to {}",
                backoff_queue
            ),
        }

        if let Err(err) = self
            .park(queue, delivery, &backoff_queue, delay_ms)
            .await
        {
            if let Err(nack_err) = delivery.nack(true).await {
                error!(
                    error = nack_err.to_string(),
                    queue = queue.name,
                    "failed to nack message after a backoff failure"
                );
            }
            return BackoffOutcome::Rejected(err);
        }

        if let Err(err) = delivery.ack().await {
            error!(
                error = err.to_string(),
                queue = queue.name,
                "failed to ack message moved to backoff"
            );
        }

        BackoffOutcome::Rescheduled {
            queue: backoff_queue,
            delay_ms,
        }
    }

    async fn park(
        &self,
        queue: &QueueDefinition,
        delivery: &Delivery,
        backoff_queue: &str,
        delay_ms: i64,
    ) -> Result<(), BusError> {
        // an empty name falls back to the default exchange too
        let dead_letter_exchange = queue
            .dead_letter_exchange()
            .filter(|exchange| !exchange.is_empty())
            .unwrap_or(&self.default_exchange)
            .to_owned();

        let def = QueueDefinition {
            name: backoff_queue.to_owned(),
            message_ttl: Some(u32::try_from(delay_ms).unwrap_or(u32::MAX)),
            dead_letter_exchange: Some(dead_letter_exchange),
            dead_letter_routing_key: Some(delivery.routing_key.clone()),
            ..queue.clone()
        };

        debug!("asserting backoff queue for routing key: {}", delivery.routing_key);
        if let Err(err) = self.broker.declare_queue(&def).await {
            error!(
                error = err.to_string(),
                queue = ?def,
                "failed to assert backoff queue"
            );
            return Err(err);
        }

        let mut properties = delivery.properties.clone();
        properties
            .headers
            .insert(AMQP_HEADERS_BACKOFF.to_owned(), HeaderValue::Int(delay_ms));

        if let Err(err) = self
            .broker
            .publish("", backoff_queue, &delivery.data, &properties)
            .await
        {
            error!(
                error = err.to_string(),
                "failed to send message to the queue {}", backoff_queue
            );
            return Err(BusError::PublishingToQueueError {
                queue: backoff_queue.to_owned(),
                reason: err.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::DeliveryStream,
        memory::InMemoryBroker,
        message::MessageProperties,
        queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
    };
    use futures_util::StreamExt;

    #[test]
    fn delays_grow_fourfold_up_to_the_ceiling() {
        let mut delay = 0;
        let mut delays = vec![];
        for _ in 0..12 {
            delay = next_delay_ms(delay);
            delays.push(delay);
        }

        assert_eq!(
            delays[..6],
            [1000, 4000, 16_000, 64_000, 256_000, 1_024_000]
        );
        assert!(delays[6..].iter().all(|d| *d == MAX_BACKOFF_MS));
        assert_eq!(next_delay_ms(-5), INITIAL_BACKOFF_MS);
    }

    #[test]
    fn queue_names_encode_tier_and_routing_key() {
        assert_eq!(
            backoff_queue_name("test-queue-1", 4000, "automation.run"),
            "test-queue-1.backoff-4s+automation.run"
        );
        assert_eq!(
            backoff_queue_name("q", MAX_BACKOFF_MS, "k"),
            "q.backoff-1048s+k"
        );
    }

    async fn setup(broker: &InMemoryBroker, queue: &QueueDefinition) -> DeliveryStream {
        broker.declare_queue(queue).await.unwrap();
        broker
            .bind_queue(&queue.name, "amq.topic", "automation.run")
            .await
            .unwrap();
        broker
            .consume(&queue.name, "consumer", None)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reschedules_and_redelivers_after_the_delay() {
        let broker = InMemoryBroker::new();
        let queue = QueueDefinition::new("test-queue-1");
        let mut deliveries = setup(&broker, &queue).await;
        let scheduler = BackoffScheduler::new(Arc::new(broker.clone()), "amq.topic");

        broker
            .publish("amq.topic", "automation.run", b"{}", &MessageProperties::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();

        let outcome = scheduler.reschedule(&queue, &delivery, None).await;
        assert_eq!(
            outcome,
            BackoffOutcome::Rescheduled {
                queue: "test-queue-1.backoff-1s+automation.run".into(),
                delay_ms: 1000,
            }
        );

        let args = broker
            .queue_arguments("test-queue-1.backoff-1s+automation.run")
            .unwrap();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("amq.topic"))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("automation.run"))
        );
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.unacked_count("test-queue-1"), Some(0));

        let redelivered = deliveries.next().await.unwrap();
        assert_eq!(redelivered.routing_key, "automation.run");
        assert_eq!(
            redelivered.properties.headers.get(AMQP_HEADERS_BACKOFF),
            Some(&HeaderValue::Int(1000))
        );

        let outcome = scheduler.reschedule(&queue, &redelivered, None).await;
        assert!(matches!(
            outcome,
            BackoffOutcome::Rescheduled { delay_ms: 4000, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn honors_the_queue_dead_letter_exchange() {
        let broker = InMemoryBroker::new();
        let queue = QueueDefinition::new("test-queue-dlx").dead_letter_exchange_only("amq.direct");
        let mut deliveries = setup(&broker, &queue).await;
        let scheduler = BackoffScheduler::new(Arc::new(broker.clone()), "amq.topic");

        broker
            .publish("amq.topic", "automation.run", b"{}", &MessageProperties::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();
        scheduler.reschedule(&queue, &delivery, None).await;

        let args = broker
            .queue_arguments("test-queue-dlx.backoff-1s+automation.run")
            .unwrap();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("amq.direct"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_dead_letter_exchange_uses_the_default_exchange() {
        let broker = InMemoryBroker::new();
        let queue = QueueDefinition::new("test-queue-empty-dlx").dead_letter_exchange_only("");
        let mut deliveries = setup(&broker, &queue).await;
        let scheduler = BackoffScheduler::new(Arc::new(broker.clone()), "amq.topic");

        broker
            .publish("amq.topic", "automation.run", b"{}", &MessageProperties::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();
        scheduler.reschedule(&queue, &delivery, None).await;

        let args = broker
            .queue_arguments("test-queue-empty-dlx.backoff-1s+automation.run")
            .unwrap();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("amq.topic"))
        );

        let redelivered = deliveries.next().await.unwrap();
        assert_eq!(redelivered.routing_key, "automation.run");
    }

    #[tokio::test(start_paused = true)]
    async fn nacks_when_the_backoff_queue_cannot_be_asserted() {
        let broker = InMemoryBroker::new();
        let queue = QueueDefinition::new("test-queue-1");
        let mut deliveries = setup(&broker, &queue).await;
        let scheduler = BackoffScheduler::new(Arc::new(broker.clone()), "amq.topic");

        broker
            .declare_queue(&QueueDefinition::new("test-queue-1.backoff-1s+automation.run").ttl(5))
            .await
            .unwrap();
        broker
            .publish("amq.topic", "automation.run", b"{}", &MessageProperties::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();

        let outcome = scheduler
            .reschedule(&queue, &delivery, Some(&"boom".into()))
            .await;

        assert!(matches!(
            outcome,
            BackoffOutcome::Rejected(BusError::DeclareQueueError { .. })
        ));
        assert_eq!(broker.stats().nacked, 1);
        assert_eq!(broker.stats().acked, 0);

        let requeued = deliveries.next().await.unwrap();
        assert!(requeued.redelivered);

        broker
            .publish("amq.topic", "automation.run", b"{}", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.stats().channels_reopened, 1);
    }
}
