// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Bus
//!
//! `BusError` is the single error type surfaced by the bus. It covers the
//! configuration, topology, transport, consumer and provisioning failures a
//! caller can observe. Handler failures are not part of it: they are recovered
//! by the backoff path and only ever logged.

use thiserror::Error;

/// Error returned by a message handler.
///
/// Handlers may fail with any error type; the consumer engine only logs it and
/// hands the delivery to the backoff scheduler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while operating the message bus.
///
/// The enum is `Clone` so the bootstrap barrier can hand the same outcome to
/// every operation waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Static or environment configuration is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The default exchange kind read from the environment is not supported
    #[error("wrong default exchange type `{0}`")]
    InvalidExchangeKind(String),

    /// A consumer was registered for a queue the bus never asserted
    #[error("provided queue name `{queue}` is not present in the applied config, which includes the following queue names: {known:?}")]
    UnknownQueue { queue: String, known: Vec<String> },

    /// `init` was invoked more than once
    #[error("message bus was already initialized")]
    AlreadyInitialized,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The broker connection was closed
    #[error("connection closed")]
    Closed,

    /// Error declaring an exchange
    #[error("failed to assert exchange `{name}`: {reason}")]
    DeclareExchangeError { name: String, reason: String },

    /// Error declaring a queue
    #[error("failed to assert queue `{name}`: {reason}")]
    DeclareQueueError { name: String, reason: String },

    /// Error binding an exchange to a queue
    #[error("failed to bind queue `{queue}` to exchange `{exchange}` via the routing key `{routing_key}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        routing_key: String,
        reason: String,
    },

    /// Error publishing a message to an exchange
    #[error("message bus encountered an error when publishing to exchange `{exchange}` with routing key `{routing_key}`: {reason}")]
    PublishingError {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Error publishing a message directly to a queue
    #[error("message bus encountered an error when publishing a message to queue `{queue}`: {reason}")]
    PublishingToQueueError { queue: String, reason: String },

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error registering a consumer
    #[error("failure to declare consumer on `{queue}`: {reason}")]
    ConsumerDeclarationError { queue: String, reason: String },

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{tag}`: {reason}")]
    ConsumerCancelError { tag: String, reason: String },

    /// Error purging a queue
    #[error("failure to purge queue `{queue}`: {reason}")]
    PurgeQueueError { queue: String, reason: String },

    /// Error deleting a queue
    #[error("failure to delete queue `{queue}`: {reason}")]
    DeleteQueueError { queue: String, reason: String },

    /// Transport-level failure talking to the provisioning control API
    #[error("control api transport error: {0}")]
    ControlApiError(String),
}
