// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes JSON messages to an exchange or straight to a queue. Every
//! message carries a fresh message id and the current OpenTelemetry context.
//! Publishing never retries: a transport failure is wrapped into one
//! descriptive [`BusError`] and returned to the caller.

use crate::{
    broker::Broker,
    errors::BusError,
    message::{Envelope, MessageProperties, PublishOptions, JSON_CONTENT_TYPE},
    otel,
    testing::MessageLog,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes messages over the shared broker channel.
pub struct PublisherEngine {
    broker: Arc<dyn Broker>,
    default_exchange: String,
    log: Option<Arc<MessageLog>>,
}

impl PublisherEngine {
    /// Creates a publisher sending to `default_exchange` unless an envelope
    /// names another exchange.
    pub fn new(
        broker: Arc<dyn Broker>,
        default_exchange: &str,
        log: Option<Arc<MessageLog>>,
    ) -> PublisherEngine {
        PublisherEngine {
            broker,
            default_exchange: default_exchange.to_owned(),
            log,
        }
    }

    pub fn default_exchange(&self) -> &str {
        &self.default_exchange
    }

    /// Publishes `envelope` through its exchange, or the default exchange.
    pub async fn publish<T>(&self, envelope: &Envelope<T>) -> Result<(), BusError>
    where
        T: Serialize + Sync,
    {
        let exchange = envelope
            .exchange
            .as_deref()
            .unwrap_or(&self.default_exchange);

        let wrap = |reason: String| BusError::PublishingError {
            exchange: exchange.to_owned(),
            routing_key: envelope.key.clone(),
            reason,
        };

        let body = serde_json::to_value(&envelope.body)
            .map_err(|err| BusError::SerializePayloadError(err.to_string()))?;
        let data = serde_json::to_vec(&body)
            .map_err(|err| BusError::SerializePayloadError(err.to_string()))?;

        debug!("-> publishing [{}]", envelope.key);

        if let Err(err) = self
            .broker
            .publish(exchange, &envelope.key, &data, &properties(&envelope.options))
            .await
        {
            error!(
                error = err.to_string(),
                exchange,
                routing_key = envelope.key,
                "unable to publish message"
            );
            return Err(wrap(err.to_string()));
        }

        if let Some(log) = &self.log {
            log.record_published(&envelope.key, body);
        }

        Ok(())
    }

    /// Sends `body` directly to `queue`, bypassing exchange routing.
    pub async fn publish_to_queue<T>(
        &self,
        queue: &str,
        body: &T,
        options: &PublishOptions,
    ) -> Result<(), BusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let data =
            serde_json::to_vec(body).map_err(|err| BusError::SerializePayloadError(err.to_string()))?;

        debug!("publishing message to queue={}", queue);

        if let Err(err) = self
            .broker
            .publish("", queue, &data, &properties(options))
            .await
        {
            error!(error = err.to_string(), queue, "unable to publish message to queue");
            return Err(BusError::PublishingToQueueError {
                queue: queue.to_owned(),
                reason: err.to_string(),
            });
        }

        Ok(())
    }
}

fn properties(options: &PublishOptions) -> MessageProperties {
    let mut headers = options.headers.clone();
    otel::inject(&Context::current(), &mut headers);

    MessageProperties {
        headers,
        content_type: Some(JSON_CONTENT_TYPE.to_owned()),
        message_id: Some(Uuid::new_v4().to_string()),
        kind: options.message_type.clone(),
        persistent: options.persistent,
    }
}
