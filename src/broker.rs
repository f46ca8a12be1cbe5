// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The bus never talks to a wire protocol directly. It drives a [`Broker`]:
//! an opaque handle exposing the AMQP 0-9-1 operations the reliability layer
//! needs. [`crate::channel`] implements it on top of `lapin`, and
//! [`crate::memory`] implements it in process for tests.

use crate::{
    errors::BusError,
    exchange::ExchangeDefinition,
    message::MessageProperties,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries for one consumer registration.
///
/// The stream ends when the consumer is cancelled, either explicitly or by
/// the broker.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Operations the bus needs from a live broker channel.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Asserts an exchange. Re-asserting an equivalent exchange is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError>;

    /// Asserts a queue. Re-asserting an equivalent queue is a no-op.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BusError>;

    /// Publishes a message and waits for the broker to confirm it.
    ///
    /// An empty `exchange` is the nameless default exchange, which routes
    /// straight to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError>;

    /// Registers a consumer on `queue`, optionally bounding unacked deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BusError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError>;

    /// Removes every ready message and returns how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, BusError>;

    /// Deletes a queue and returns how many messages it still held.
    async fn delete_queue(&self, queue: &str) -> Result<u32, BusError>;

    fn is_connected(&self) -> bool;

    /// Resolves once the underlying connection is lost or closed. Never
    /// resolves while the connection stays up.
    async fn disconnected(&self);

    async fn close(&self) -> Result<(), BusError>;
}

/// Opens broker handles.
///
/// A connector opens one connection per call. Recovering from a lost
/// connection is the job of [`crate::session::ReconnectingBroker`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BusError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), BusError>;

    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: MessageProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("size", &self.data.len())
            .finish()
    }
}
