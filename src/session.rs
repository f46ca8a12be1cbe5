// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Broker Session
//!
//! [`ReconnectingBroker`] keeps one logical broker session alive across
//! connection losses. It wraps the handle produced by a [`Connector`] and:
//! - reconnects under a [`RetryPolicy`] as soon as the connection drops;
//! - replays every exchange, queue and binding asserted through it, in the
//!   original order, before handing out the new connection;
//! - re-registers live consumers under their original tags, so a delivery
//!   stream returned by [`Broker::consume`] survives the reconnect.
//!
//! A delivery stream ends only when its consumer is cancelled, by the caller
//! or by the broker on a live connection, or when the session is closed.

use crate::{
    broker::{Broker, Connector, Delivery, DeliveryStream},
    config::redact_url,
    errors::BusError,
    exchange::ExchangeDefinition,
    message::MessageProperties,
    queue::QueueDefinition,
    retry::RetryPolicy,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument::WithSubscriber};

/// An assertion replayed on every new connection.
#[derive(Debug, Clone, PartialEq)]
enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

#[derive(Debug, Clone)]
struct Subscription {
    queue: String,
    prefetch: Option<u16>,
}

/// The connection currently in use and how many reconnects produced it.
#[derive(Clone)]
struct Current {
    broker: Arc<dyn Broker>,
    generation: u64,
}

struct Session {
    connector: Arc<dyn Connector>,
    url: String,
    retry: RetryPolicy,
    current: RwLock<Current>,
    reconnecting: tokio::sync::Mutex<()>,
    declarations: Mutex<Vec<Declaration>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    closed: AtomicBool,
}

/// A [`Broker`] that survives connection losses.
pub struct ReconnectingBroker {
    session: Arc<Session>,
}

impl ReconnectingBroker {
    /// Connects to `url`, retrying failed attempts as `retry` allows, and
    /// starts watching the connection.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        url: &str,
        retry: RetryPolicy,
    ) -> Result<ReconnectingBroker, BusError> {
        let name = format!("connection to {}", redact_url(url));
        let broker = retry.run(&name, || connector.connect(url)).await?;

        let session = Arc::new(Session {
            connector,
            url: url.to_owned(),
            retry,
            current: RwLock::new(Current {
                broker,
                generation: 0,
            }),
            reconnecting: tokio::sync::Mutex::new(()),
            declarations: Mutex::new(vec![]),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        watch(&session);

        Ok(ReconnectingBroker { session })
    }

    /// Number of reconnects performed since the session was opened.
    pub fn reconnects(&self) -> u64 {
        self.session.current.read().generation
    }
}

impl Session {
    fn current(&self) -> Current {
        self.current.read().clone()
    }

    /// The live connection, reconnecting first when it was lost.
    async fn broker(&self) -> Result<Arc<dyn Broker>, BusError> {
        let current = self.current();
        if current.broker.is_connected() {
            return Ok(current.broker);
        }
        self.reconnect(current.generation).await
    }

    /// Replaces the connection of generation `lost`. Concurrent callers that
    /// observed the same generation share a single reconnect.
    async fn reconnect(&self, lost: u64) -> Result<Arc<dyn Broker>, BusError> {
        let _serialized = self.reconnecting.lock().await;

        let current = self.current();
        if current.generation != lost {
            return Ok(current.broker);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let redacted = redact_url(&self.url);
        info!("reconnecting to {}", redacted);

        let name = format!("reconnection to {}", redacted);
        let broker = self
            .retry
            .run(&name, || async move {
                if self.closed.load(Ordering::SeqCst) {
                    return Ok::<_, BusError>(None);
                }
                let broker = self.connector.connect(&self.url).await?;
                if let Err(err) = self.replay(broker.as_ref()).await {
                    if let Err(close) = broker.close().await {
                        debug!(error = close.to_string(), "error closing the unused connection");
                    }
                    return Err(err);
                }
                Ok(Some(broker))
            })
            .await?;

        let Some(broker) = broker else {
            return Err(BusError::Closed);
        };

        *self.current.write() = Current {
            broker: broker.clone(),
            generation: lost + 1,
        };
        info!(reconnects = lost + 1, "reconnected to {}", redacted);

        Ok(broker)
    }

    async fn replay(&self, broker: &dyn Broker) -> Result<(), BusError> {
        let declarations = self.declarations.lock().clone();
        debug!("replaying {} topology assertions", declarations.len());

        for declaration in &declarations {
            match declaration {
                Declaration::Exchange(def) => broker.declare_exchange(def).await?,
                Declaration::Queue(def) => broker.declare_queue(def).await?,
                Declaration::Binding {
                    queue,
                    exchange,
                    routing_key,
                } => broker.bind_queue(queue, exchange, routing_key).await?,
            }
        }

        Ok(())
    }

    fn record(&self, declaration: Declaration) {
        let mut declarations = self.declarations.lock();
        if !declarations.contains(&declaration) {
            declarations.push(declaration);
        }
    }

    fn forget_queue(&self, name: &str) {
        self.declarations.lock().retain(|declaration| match declaration {
            Declaration::Queue(def) => def.name != name,
            Declaration::Binding { queue, .. } => queue != name,
            Declaration::Exchange(_) => true,
        });
    }

    fn subscription(&self, consumer_tag: &str) -> Option<Subscription> {
        self.subscriptions.lock().get(consumer_tag).cloned()
    }
}

/// Reconnects as soon as the current connection drops.
fn watch(session: &Arc<Session>) {
    let weak = Arc::downgrade(session);
    let watcher = async move {
        loop {
            let Some(current) = weak.upgrade().map(|session| session.current()) else {
                return;
            };
            current.broker.disconnected().await;

            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = session.reconnect(current.generation).await {
                debug!(error = err.to_string(), "stopped watching the connection");
                return;
            }
        }
    };
    tokio::spawn(watcher.with_current_subscriber());
}

/// Forwards the deliveries of `consumer_tag` into `sender`, re-registering
/// the consumer on every new connection.
async fn pump(
    session: Weak<Session>,
    consumer_tag: String,
    mut deliveries: DeliveryStream,
    mut generation: u64,
    sender: mpsc::UnboundedSender<Delivery>,
) {
    loop {
        while let Some(delivery) = deliveries.next().await {
            if sender.send(delivery).is_err() {
                return;
            }
        }

        let Some(session) = session.upgrade() else {
            return;
        };
        if session.subscription(&consumer_tag).is_none() {
            return;
        }

        let current = session.current();
        if current.generation == generation && current.broker.is_connected() {
            info!(tag = consumer_tag, "consumer was cancelled by the broker");
            session.subscriptions.lock().remove(&consumer_tag);
            return;
        }

        let broker = match session.reconnect(generation).await {
            Ok(broker) => broker,
            Err(err) => {
                debug!(error = err.to_string(), tag = consumer_tag, "consumer ended");
                session.subscriptions.lock().remove(&consumer_tag);
                return;
            }
        };
        generation = session.current().generation;

        // it may have been cancelled while reconnecting
        let Some(subscription) = session.subscription(&consumer_tag) else {
            return;
        };

        deliveries = match broker
            .consume(&subscription.queue, &consumer_tag, subscription.prefetch)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    tag = consumer_tag,
                    queue = subscription.queue,
                    "failure to resume the consumer"
                );
                session.subscriptions.lock().remove(&consumer_tag);
                return;
            }
        };
        info!(
            tag = consumer_tag,
            queue = subscription.queue,
            "consumer resumed after reconnect"
        );
    }
}

#[async_trait]
impl Broker for ReconnectingBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        self.session.broker().await?.declare_exchange(def).await?;
        self.session.record(Declaration::Exchange(def.clone()));
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError> {
        self.session.broker().await?.declare_queue(def).await?;
        self.session.record(Declaration::Queue(def.clone()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.session
            .broker()
            .await?
            .bind_queue(queue, exchange, routing_key)
            .await?;
        self.session.record(Declaration::Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        self.session
            .broker()
            .await?
            .publish(exchange, routing_key, body, properties)
            .await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BusError> {
        let broker = self.session.broker().await?;
        let generation = self.session.current().generation;
        let deliveries = broker.consume(queue, consumer_tag, prefetch).await?;

        self.session.subscriptions.lock().insert(
            consumer_tag.to_owned(),
            Subscription {
                queue: queue.to_owned(),
                prefetch,
            },
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(
            pump(
                Arc::downgrade(&self.session),
                consumer_tag.to_owned(),
                deliveries,
                generation,
                sender,
            )
            .with_current_subscriber(),
        );

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.session.subscriptions.lock().remove(consumer_tag);
        self.session.current().broker.cancel(consumer_tag).await
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BusError> {
        self.session.broker().await?.purge_queue(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BusError> {
        let count = self.session.broker().await?.delete_queue(queue).await?;
        self.session.forget_queue(queue);
        Ok(count)
    }

    fn is_connected(&self) -> bool {
        !self.session.closed.load(Ordering::SeqCst)
            && self.session.current().broker.is_connected()
    }

    /// Resolves when the connection in use drops, even if a reconnect
    /// replaces it right after.
    async fn disconnected(&self) {
        let current = self.session.current();
        current.broker.disconnected().await;
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.subscriptions.lock().clear();

        // wait out a reconnect in flight so its connection gets closed too
        let _serialized = self.session.reconnecting.lock().await;
        self.session.current().broker.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBroker, InMemoryConnector};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    async fn session(connector: &InMemoryConnector) -> ReconnectingBroker {
        ReconnectingBroker::connect(
            Arc::new(connector.clone()),
            "amqp://localhost",
            RetryPolicy::unbounded(Duration::from_secs(1)),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_resume_after_the_connection_drops() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let broker = connector.broker().clone();
        let session = session(&connector).await;

        session.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        session.bind_queue("q", "amq.topic", "automation.#").await.unwrap();
        let mut deliveries = session.consume("q", "worker-1", Some(1)).await.unwrap();

        broker.drop_connections();
        sleep(Duration::from_millis(10)).await;

        assert!(session.is_connected());
        assert_eq!(session.reconnects(), 1);
        assert_eq!(broker.consumer_count("q"), 1);

        session
            .publish("amq.topic", "automation.run", b"1", &MessageProperties::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.data, b"1".to_vec());
        delivery.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn topology_is_replayed_on_the_new_connection() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let broker = connector.broker().clone();
        let session = session(&connector).await;

        session
            .declare_exchange(&ExchangeDefinition::new("exchange2").direct())
            .await
            .unwrap();
        session.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        session.bind_queue("q", "exchange2", "key").await.unwrap();
        let before = broker.stats();

        broker.drop_connections();
        sleep(Duration::from_millis(10)).await;

        let after = broker.stats();
        assert_eq!(after.exchange_declarations, before.exchange_declarations + 1);
        assert_eq!(after.queue_declarations, before.queue_declarations + 1);
        assert_eq!(after.bindings, before.bindings + 1);
        assert_eq!(after.connections_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_follow_the_retry_delay() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let broker = connector.broker().clone();
        let session = session(&connector).await;
        session.declare_queue(&QueueDefinition::new("q")).await.unwrap();

        let connector = connector.fail_first(2);
        let started = Instant::now();
        broker.drop_connections();

        session
            .publish("", "q", b"1", &MessageProperties::default())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connector.connected_urls().len(), 4);
        assert_eq!(broker.ready_count("q"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_side_cancellation_ends_the_stream() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let session = session(&connector).await;
        session.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut deliveries = session.consume("q", "worker-1", None).await.unwrap();

        assert_eq!(session.delete_queue("q").await.unwrap(), 0);

        assert!(deliveries.next().await.is_none());
        assert_eq!(session.reconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_sessions_stay_closed() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let broker = connector.broker().clone();
        let session = session(&connector).await;
        session.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut deliveries = session.consume("q", "worker-1", None).await.unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert!(!session.is_connected());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.stats().connections_opened, 1);
        assert!(matches!(
            session.publish("", "q", b"1", &MessageProperties::default()).await,
            Err(BusError::Closed)
        ));
    }
}
