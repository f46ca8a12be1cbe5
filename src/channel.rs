// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! [`Broker`] implementation on top of `lapin`. One connection carries a
//! shared channel in publisher-confirm mode for topology and publishing, and
//! one dedicated channel per consumer so a `basic.qos` limit or a channel
//! error never reaches anyone else.
//!
//! The broker closes a channel on any channel-level error, such as an
//! inequivalent redeclaration or a binding to a missing exchange. The shared
//! channel is then reopened, with publisher confirms, before its next use.
//! A lost connection is not recovered here; see
//! [`crate::session::ReconnectingBroker`].

use crate::{
    broker::{Acknowledger, Broker, Connector, Delivery, DeliveryStream},
    config::{redact_url, ConnectionOptions},
    errors::BusError,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers, MessageProperties},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, ByteArray, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens `lapin` connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    options: ConnectionOptions,
}

impl AmqpConnector {
    pub fn new(options: ConnectionOptions) -> AmqpConnector {
        AmqpConnector { options }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BusError> {
        let redacted = redact_url(url);
        info!("connecting to {}", redacted);

        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.options.connection_name.clone()));

        let connection = match Connection::connect(url, properties).await {
            Ok(c) => c,
            Err(err) => {
                warn!(error = err.to_string(), "failed to connect to {}", redacted);
                return Err(BusError::ConnectionError(err.to_string()));
            }
        };

        let up = Arc::new(watch::Sender::new(true));
        let lost = up.clone();
        let target = redacted.clone();
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "disconnected from {}", target);
            lost.send_replace(false);
        });

        let channel = open_confirm_channel(&connection).await?;

        info!("connected to {}", redacted);

        Ok(Arc::new(AmqpBroker {
            connection,
            channel: tokio::sync::Mutex::new(channel),
            consumer_channels: Mutex::new(HashMap::new()),
            up,
        }))
    }
}

async fn open_confirm_channel(connection: &Connection) -> Result<Channel, BusError> {
    let channel = open_channel(connection).await?;

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        close_channel(&channel, "publisher confirms unavailable").await;
        return Err(BusError::ChannelError(err.to_string()));
    }

    Ok(channel)
}

async fn open_channel(connection: &Connection) -> Result<Channel, BusError> {
    debug!("creating amqp channel...");
    match connection.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(BusError::ChannelError(err.to_string()))
        }
    }
}

async fn close_channel(channel: &Channel, reason: &str) {
    if !channel.status().connected() {
        return;
    }
    if let Err(err) = channel.close(200, reason).await {
        warn!(error = err.to_string(), "error to close the channel");
    }
}

/// A live AMQP connection, its shared channel and the consumer channels.
pub struct AmqpBroker {
    connection: Connection,
    channel: tokio::sync::Mutex<Channel>,
    consumer_channels: Mutex<HashMap<String, Channel>>,
    up: Arc<watch::Sender<bool>>,
}

impl AmqpBroker {
    /// The shared channel, reopened first if the broker closed it.
    async fn shared_channel(&self) -> Result<Channel, BusError> {
        let mut channel = self.channel.lock().await;
        if channel.status().connected() {
            return Ok(channel.clone());
        }
        if !self.is_connected() {
            return Err(BusError::Closed);
        }

        warn!(channel = channel.id(), "shared channel was closed, reopening it");
        *channel = open_confirm_channel(&self.connection).await?;

        Ok(channel.clone())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        self.shared_channel()
            .await?
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                to_field_table(&def.arguments),
            )
            .await
            .map_err(|err| BusError::DeclareExchangeError {
                name: def.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError> {
        self.shared_channel()
            .await?
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                to_field_table(&def.declare_arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| BusError::DeclareQueueError {
                name: def.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.shared_channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BusError::BindingExchangeToQueueError {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        let confirm = self
            .shared_channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|err| BusError::ChannelError(err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| BusError::ChannelError(err.to_string()))?;

        if confirmation.is_nack() {
            return Err(BusError::ChannelError(
                "message was rejected by the broker".to_owned(),
            ));
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BusError> {
        let failure = |reason: String| BusError::ConsumerDeclarationError {
            queue: queue.to_owned(),
            reason,
        };

        let channel = open_channel(&self.connection).await?;

        if let Some(count) = prefetch {
            if let Err(err) = channel
                .basic_qos(count, BasicQosOptions { global: false })
                .await
            {
                close_channel(&channel, "consumer declaration failed").await;
                return Err(failure(err.to_string()));
            }
        }

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                close_channel(&channel, "consumer declaration failed").await;
                return Err(failure(err.to_string()));
            }
        };

        self.consumer_channels
            .lock()
            .insert(consumer_tag.to_owned(), channel);

        let tag = consumer_tag.to_owned();
        Ok(consumer
            .filter_map(move |result| {
                let delivery = match result {
                    Ok(delivery) => Some(from_lapin_delivery(delivery)),
                    Err(err) => {
                        error!(error = err.to_string(), consumer = tag, "errors consume msg");
                        None
                    }
                };
                future::ready(delivery)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let channel = self.consumer_channels.lock().remove(consumer_tag);
        let Some(channel) = channel else {
            debug!(tag = consumer_tag, "consumer has no open channel");
            return Ok(());
        };

        let cancelled = channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| BusError::ConsumerCancelError {
                tag: consumer_tag.to_owned(),
                reason: err.to_string(),
            });
        close_channel(&channel, "consumer cancelled").await;

        cancelled
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BusError> {
        self.shared_channel()
            .await?
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| BusError::PurgeQueueError {
                queue: queue.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BusError> {
        self.shared_channel()
            .await?
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|err| BusError::DeleteQueueError {
                queue: queue.to_owned(),
                reason: err.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        *self.up.borrow() && self.connection.status().connected()
    }

    async fn disconnected(&self) {
        let mut up = self.up.subscribe();
        // the sender lives as long as self
        let _ = up.wait_for(|up| !*up).await;
    }

    async fn close(&self) -> Result<(), BusError> {
        let dedicated: Vec<Channel> = self
            .consumer_channels
            .lock()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in dedicated {
            close_channel(&channel, "OK").await;
        }

        let shared = self.channel.lock().await.clone();
        close_channel(&shared, "OK").await;

        self.up.send_replace(false);
        self.connection
            .close(200, "OK")
            .await
            .map_err(|err| BusError::ConnectionError(err.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| BusError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| BusError::NackMessageError(err.to_string()))
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);

    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        properties,
        delivery.data,
        Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    )
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(to_field_table(&properties.headers));

    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(kind) = &properties.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), to_amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), from_amqp_value(value)))
        .collect()
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => match i32::try_from(*v) {
            Ok(small) => AMQPValue::LongInt(small),
            Err(_) => AMQPValue::LongLongInt(*v),
        },
        HeaderValue::UInt(v) => match u32::try_from(*v) {
            Ok(small) => AMQPValue::LongUInt(small),
            Err(_) => AMQPValue::Timestamp(*v),
        },
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(table) => AMQPValue::FieldTable(to_field_table(table)),
        HeaderValue::Void => AMQPValue::Void,
    }
}

fn from_amqp_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::UInt(*v),
        AMQPValue::Float(v) => HeaderValue::Float((*v).into()),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(v) => {
            HeaderValue::Float(f64::from(v.value) / 10f64.powi(v.scale.into()))
        }
        AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        AMQPValue::FieldArray(values) => {
            HeaderValue::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
        AMQPValue::Void => HeaderValue::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_tables_survive_conversion() {
        let mut nested = Headers::new();
        nested.insert("count".into(), HeaderValue::Int(2));

        let mut headers = Headers::new();
        headers.insert("x-backoff-sec".into(), HeaderValue::Int(4000));
        headers.insert("traceparent".into(), HeaderValue::from("00-abc-def-01"));
        headers.insert("x-large".into(), HeaderValue::Int(i64::from(i32::MAX) + 1));
        headers.insert(
            "x-death".into(),
            HeaderValue::Array(vec![HeaderValue::Table(nested)]),
        );

        assert_eq!(from_field_table(&to_field_table(&headers)), headers);
    }

    #[test]
    fn small_integers_are_sent_as_long_ints() {
        assert_eq!(to_amqp_value(&HeaderValue::Int(1000)), AMQPValue::LongInt(1000));
        assert_eq!(
            to_amqp_value(&HeaderValue::Int(1 << 40)),
            AMQPValue::LongLongInt(1 << 40)
        );
    }

    #[test]
    fn persistent_messages_use_delivery_mode_two() {
        let properties = MessageProperties {
            content_type: Some("application/json".into()),
            kind: Some("pipeline.step".into()),
            persistent: true,
            ..MessageProperties::default()
        };

        let basic = to_basic_properties(&properties);
        assert_eq!(*basic.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(from_basic_properties(&basic), properties);
    }
}
