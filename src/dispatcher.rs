// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Engine
//!
//! Registers one consumer per `consume` call and drives its delivery stream
//! on a spawned task. Deliveries are processed concurrently unless a prefetch
//! limit is given, in which case at most that many run at once; a limit of
//! one processes a queue strictly in order.
//!
//! Each registration moves through [`ConsumerState`]: `Idle` until the broker
//! accepts it, `Consuming` while the stream is open, and `Cancelled` once it
//! is stopped explicitly or by the broker.

use crate::{
    backoff::BackoffScheduler,
    broker::Broker,
    consumer::{consume, ConsumerContext, MessageHandler},
    errors::BusError,
    queue::QueueDefinition,
    testing::MessageLog,
};
use futures_util::StreamExt;
use opentelemetry::global;
use parking_lot::{Mutex, RwLock};
use std::{future::Future, sync::Arc};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument::WithSubscriber, Dispatch};
use uuid::Uuid;

/// Lifecycle of a consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Cancelled,
}

/// Caller-side view of a consumer registration.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    tag: String,
    queue: String,
    state: Arc<RwLock<ConsumerState>>,
}

impl ConsumerHandle {
    /// Returns the consumer tag.
    ///
    /// # Returns
    /// The broker consumer tag, `<hostname>-<uuid>`, kept across reconnects
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns the current lifecycle state.
    ///
    /// A consumer survives reconnects in the `Consuming` state; it only
    /// becomes `Cancelled` when stopped, when the broker cancels it on a live
    /// connection, or when the bus closes.
    pub fn state(&self) -> ConsumerState {
        *self.state.read()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.write() = state;
    }
}

/// Registers consumers and stops them.
pub struct ConsumerEngine {
    broker: Arc<dyn Broker>,
    scheduler: Arc<BackoffScheduler>,
    hostname: String,
    log: Option<Arc<MessageLog>>,
    dispatch: Option<Dispatch>,
    consumers: Arc<Mutex<Vec<ConsumerHandle>>>,
}

impl ConsumerEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        scheduler: Arc<BackoffScheduler>,
        hostname: &str,
        log: Option<Arc<MessageLog>>,
        dispatch: Option<Dispatch>,
    ) -> ConsumerEngine {
        ConsumerEngine {
            broker,
            scheduler,
            hostname: hostname.to_owned(),
            log,
            dispatch,
            consumers: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Starts consuming `queue`, handing every delivery to `handler`.
    ///
    /// # Parameters
    /// * `queue` - The applied definition of the consumed queue
    /// * `prefetch` - Maximum deliveries processed at once, unbounded if `None`
    /// * `handler` - Callback invoked for every delivery
    ///
    /// # Returns
    /// A handle in the `Consuming` state, or the broker error that prevented
    /// the registration
    pub async fn register(
        &self,
        queue: QueueDefinition,
        prefetch: Option<u16>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, BusError> {
        let handle = ConsumerHandle {
            tag: format!("{}-{}", self.hostname, Uuid::new_v4().simple()),
            queue: queue.name.clone(),
            state: Arc::new(RwLock::new(ConsumerState::Idle)),
        };

        let mut deliveries = match self.broker.consume(&queue.name, &handle.tag, prefetch).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue.name,
                    "failure to create the consumer"
                );
                return Err(err);
            }
        };

        handle.set_state(ConsumerState::Consuming);
        self.consumers.lock().push(handle.clone());
        info!("registered a new consumer for queue={}", queue.name);

        let limit = prefetch
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(usize::from(n))));
        let ctx = Arc::new(ConsumerContext {
            queue,
            consumer_tag: handle.tag.clone(),
            handler,
            scheduler: self.scheduler.clone(),
            log: self.log.clone(),
        });
        let dispatch = self.dispatch.clone();
        let registry = self.consumers.clone();
        let task_handle = handle.clone();

        spawn(&self.dispatch, async move {
            while let Some(delivery) = deliveries.next().await {
                let permit = match &limit {
                    Some(semaphore) => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                let ctx = ctx.clone();
                spawn(&dispatch, async move {
                    consume(&global::tracer("message-bus consumer"), &ctx, delivery).await;
                    drop(permit);
                });
            }

            task_handle.set_state(ConsumerState::Cancelled);
            registry.lock().retain(|handle| handle.tag != task_handle.tag);
            info!("consumer {} was cancelled", task_handle.tag);
        });

        Ok(handle)
    }

    /// Handles of every consumer registered and not yet stopped or cancelled
    /// by the broker.
    pub fn consumers(&self) -> Vec<ConsumerHandle> {
        self.consumers.lock().clone()
    }

    /// Cancels every registered consumer. Calling it with no consumers is a
    /// no-op.
    pub async fn stop_all(&self) {
        let consumers: Vec<ConsumerHandle> = self.consumers.lock().drain(..).collect();
        if consumers.is_empty() {
            debug!("no consumers to cancel");
            return;
        }

        for handle in consumers {
            if let Err(err) = self.broker.cancel(&handle.tag).await {
                error!(
                    error = err.to_string(),
                    tag = handle.tag,
                    "failure to cancel the consumer"
                );
            }
            handle.set_state(ConsumerState::Cancelled);
        }
    }
}

fn spawn<F>(dispatch: &Option<Dispatch>, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match dispatch {
        Some(dispatch) => {
            tokio::spawn(future.with_subscriber(dispatch.clone()));
        }
        None => {
            tokio::spawn(future);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::IncomingMessage, errors::HandlerError, memory::InMemoryBroker,
        message::MessageProperties,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn engine(broker: &InMemoryBroker) -> ConsumerEngine {
        broker
            .declare_queue(&QueueDefinition::new("test-queue-1"))
            .await
            .unwrap();
        broker
            .bind_queue("test-queue-1", "amq.topic", "automation.#")
            .await
            .unwrap();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        ConsumerEngine::new(
            shared.clone(),
            Arc::new(BackoffScheduler::new(shared, "amq.topic")),
            "worker-1",
            None,
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn registration_moves_to_consuming_then_cancelled() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker).await;

        let handle = engine
            .register(
                QueueDefinition::new("test-queue-1"),
                None,
                Arc::new(|_msg: IncomingMessage| async { Ok::<(), HandlerError>(()) }),
            )
            .await
            .unwrap();

        assert!(handle.tag().starts_with("worker-1-"));
        assert_eq!(handle.state(), ConsumerState::Consuming);
        assert_eq!(broker.consumer_count("test-queue-1"), 1);

        engine.stop_all().await;
        assert_eq!(handle.state(), ConsumerState::Cancelled);
        assert_eq!(broker.consumer_count("test-queue-1"), 0);
        assert!(engine.consumers().is_empty());

        engine.stop_all().await;
    }

    #[tokio::test]
    async fn stopping_without_consumers_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker).await;
        engine.stop_all().await;
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn unknown_broker_queue_fails_registration() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker).await;

        let err = engine
            .register(
                QueueDefinition::new("missing"),
                None,
                Arc::new(|_msg: IncomingMessage| async { Ok::<(), HandlerError>(()) }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::ConsumerDeclarationError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn broker_cancelled_consumers_leave_the_registry() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker).await;

        let handle = engine
            .register(
                QueueDefinition::new("test-queue-1"),
                None,
                Arc::new(|_msg: IncomingMessage| async { Ok::<(), HandlerError>(()) }),
            )
            .await
            .unwrap();
        assert_eq!(engine.consumers().len(), 1);

        broker.delete_queue("test-queue-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(handle.state(), ConsumerState::Cancelled);
        assert!(engine.consumers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_of_one_processes_in_publish_order() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker).await;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        engine
            .register(
                QueueDefinition::new("test-queue-1"),
                Some(1),
                Arc::new(move |msg: IncomingMessage| {
                    let sender = sender.clone();
                    async move {
                        let n = msg.body.as_json().and_then(|v| v.as_u64()).unwrap_or(0);
                        sender.send(("start", n)).ok();
                        // later messages finish faster if they ever overlap
                        tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
                        sender.send(("end", n)).ok();
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .await
            .unwrap();

        for n in 0..5u64 {
            broker
                .publish(
                    "amq.topic",
                    "automation.run",
                    n.to_string().as_bytes(),
                    &MessageProperties::default(),
                )
                .await
                .unwrap();
        }

        let mut events = vec![];
        while events.len() < 10 {
            events.push(receiver.recv().await.unwrap());
        }

        let expected: Vec<(&str, u64)> = (0..5u64)
            .flat_map(|n| [("start", n), ("end", n)])
            .collect();
        assert_eq!(events, expected);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(broker.stats().acked, 5);
    }
}
