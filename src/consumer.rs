// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Per-delivery processing: decode the body, build the handler-facing view,
//! run the handler and finalize the delivery exactly once. Success acks the
//! delivery. A handler error, a panic or an explicit
//! [`IncomingMessage::fail_this_message`] hands it to the backoff scheduler,
//! which acks it after rerouting.

use crate::{
    backoff::{BackoffOutcome, BackoffScheduler, AMQP_HEADERS_BACKOFF},
    broker::Delivery,
    errors::HandlerError,
    message::{HeaderValue, MessageProperties, Payload},
    otel,
    queue::QueueDefinition,
    testing::MessageLog,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Handles messages delivered to a consumer.
///
/// Returning an error hands the message to the backoff path; it is never
/// surfaced beyond a log line.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Records whether a delivery was finalized. The first signal wins.
#[derive(Debug, Default)]
pub struct DeliveryToken {
    finalized: AtomicBool,
}

impl DeliveryToken {
    pub fn new() -> DeliveryToken {
        DeliveryToken::default()
    }

    /// Claims the right to finalize the delivery.
    ///
    /// Returns `true` only for the first caller.
    pub fn try_finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

/// Everything needed to finalize one delivery.
struct Finalizer {
    token: DeliveryToken,
    delivery: Delivery,
    queue: QueueDefinition,
    body: Payload,
    scheduler: Arc<BackoffScheduler>,
    log: Option<Arc<MessageLog>>,
}

impl Finalizer {
    async fn fail(&self, cause: Option<HandlerError>) -> Option<BackoffOutcome> {
        if !self.token.try_finalize() {
            debug!(
                queue = self.queue.name,
                "message was already finalized, ignoring the failure signal"
            );
            return None;
        }

        let outcome = self
            .scheduler
            .reschedule(&self.queue, &self.delivery, cause.as_ref())
            .await;

        if let Some(log) = &self.log {
            log.record_rejected(&self.delivery.routing_key, self.body.to_value());
        }

        Some(outcome)
    }

    async fn succeed(&self) -> bool {
        if !self.token.try_finalize() {
            return false;
        }

        if let Err(err) = self.delivery.ack().await {
            error!(
                error = err.to_string(),
                queue = self.queue.name,
                "error while acking message"
            );
            return false;
        }

        if let Some(log) = &self.log {
            log.record_consumed(&self.delivery.routing_key, self.body.to_value());
        }

        true
    }
}

/// A delivered message as seen by a handler.
pub struct IncomingMessage {
    pub queue: String,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Payload,
    /// Trace context extracted from the message headers
    pub context: Context,
    finalizer: Arc<Finalizer>,
}

impl IncomingMessage {
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.properties.headers.get(key)
    }

    /// Delay, in milliseconds, this message already waited in backoff.
    pub fn backoff_ms(&self) -> Option<i64> {
        self.header(AMQP_HEADERS_BACKOFF).and_then(HeaderValue::as_i64)
    }

    /// Hands the message to the backoff path instead of acknowledging it.
    ///
    /// Only the first failure signal for a delivery has an effect; later
    /// calls, and a handler error raised afterwards, are ignored.
    pub async fn fail_this_message(&self, cause: Option<HandlerError>) {
        self.finalizer.fail(cause).await;
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body", &self.body)
            .finish()
    }
}

/// Shared state of one consumer registration.
pub(crate) struct ConsumerContext {
    pub(crate) queue: QueueDefinition,
    pub(crate) consumer_tag: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) scheduler: Arc<BackoffScheduler>,
    pub(crate) log: Option<Arc<MessageLog>>,
}

/// Runs the handler for one delivery and finalizes it.
pub(crate) async fn consume(tracer: &BoxedTracer, ctx: &ConsumerContext, delivery: Delivery) {
    let body = Payload::decode(&delivery.data);
    let span_name = delivery
        .properties
        .kind
        .clone()
        .unwrap_or_else(|| delivery.routing_key.clone());
    let (otel_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, &span_name);

    debug!(
        "consuming message from queue={}, routingKey={}",
        ctx.queue.name, delivery.routing_key
    );

    let message = IncomingMessage {
        queue: ctx.queue.name.clone(),
        consumer_tag: ctx.consumer_tag.clone(),
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        redelivered: delivery.redelivered,
        properties: delivery.properties.clone(),
        body: body.clone(),
        context: otel_ctx,
        finalizer: Arc::new(Finalizer {
            token: DeliveryToken::new(),
            delivery,
            queue: ctx.queue.clone(),
            body,
            scheduler: ctx.scheduler.clone(),
            log: ctx.log.clone(),
        }),
    };
    let finalizer = message.finalizer.clone();

    let result = match AssertUnwindSafe(ctx.handler.handle(message))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::from("message handler panicked")),
    };

    match result {
        Ok(()) => {
            if finalizer.succeed().await {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
            } else if finalizer.token.is_finalized() {
                span.set_status(Status::error("message was handed to backoff"));
            }
        }
        Err(err) => {
            span.record_error(&*err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            finalizer.fail(Some(err)).await;
        }
    }

    span.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::Broker, memory::InMemoryBroker};
    use futures_util::StreamExt;
    use opentelemetry::global;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn only_the_first_finalization_wins() {
        let token = DeliveryToken::new();
        assert!(!token.is_finalized());
        assert!(token.try_finalize());
        assert!(!token.try_finalize());
        assert!(token.is_finalized());
    }

    async fn deliver(broker: &InMemoryBroker, body: &[u8]) -> Delivery {
        broker
            .declare_queue(&QueueDefinition::new("test-queue-1"))
            .await
            .unwrap();
        broker
            .bind_queue("test-queue-1", "amq.topic", "automation.run")
            .await
            .unwrap();
        let mut deliveries = broker.consume("test-queue-1", "tag", None).await.unwrap();
        broker
            .publish("amq.topic", "automation.run", body, &MessageProperties::default())
            .await
            .unwrap();
        deliveries.next().await.unwrap()
    }

    fn context(broker: &InMemoryBroker, handler: Arc<dyn MessageHandler>) -> ConsumerContext {
        ConsumerContext {
            queue: QueueDefinition::new("test-queue-1"),
            consumer_tag: "tag".into(),
            handler,
            scheduler: Arc::new(BackoffScheduler::new(Arc::new(broker.clone()), "amq.topic")),
            log: Some(Arc::new(MessageLog::new())),
        }
    }

    #[tokio::test]
    async fn acks_after_successful_handling() {
        let broker = InMemoryBroker::new();
        let delivery = deliver(&broker, br#"{"pipelineId":"a"}"#).await;
        let ctx = context(
            &broker,
            Arc::new(|msg: IncomingMessage| async move {
                assert_eq!(msg.body.as_json().unwrap()["pipelineId"], "a");
                Ok::<(), HandlerError>(())
            }),
        );

        consume(&global::tracer("test"), &ctx, delivery).await;

        assert_eq!(broker.stats().acked, 1);
        assert_eq!(ctx.log.as_ref().unwrap().consumed().len(), 1);
        assert!(broker.queue_names().iter().all(|q| !q.contains("backoff")));
    }

    #[tokio::test]
    async fn repeated_failure_signals_reschedule_once() {
        let broker = InMemoryBroker::new();
        let delivery = deliver(&broker, b"plain text").await;
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let ctx = context(
            &broker,
            Arc::new(move |msg: IncomingMessage| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(msg.body.as_bytes(), Some(&b"plain text"[..]));
                    msg.fail_this_message(None).await;
                    msg.fail_this_message(Some("again".into())).await;
                    Err::<(), HandlerError>("and thrown".into())
                }
            }),
        );

        consume(&global::tracer("test"), &ctx, delivery).await;

        let stats = broker.stats();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.nacked, 0);
        assert_eq!(
            broker.ready_count("test-queue-1.backoff-1s+automation.run"),
            Some(1)
        );
        assert_eq!(ctx.log.as_ref().unwrap().rejected().len(), 1);
    }

    #[tokio::test]
    async fn panicking_handlers_go_to_backoff() {
        let broker = InMemoryBroker::new();
        let delivery = deliver(&broker, b"{}").await;
        let ctx = context(
            &broker,
            Arc::new(|_msg: IncomingMessage| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<(), HandlerError>(())
            }),
        );

        consume(&global::tracer("test"), &ctx, delivery).await;

        assert_eq!(broker.stats().acked, 1);
        assert_eq!(
            broker.ready_count("test-queue-1.backoff-1s+automation.run"),
            Some(1)
        );
    }
}
