// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for declaring queues and binding them to exchanges. Queue options
//! cover message TTL, length limits and the dead-letter target that the
//! backoff mechanism relies on to route expired messages back to their
//! original destination.

use crate::message::{HeaderValue, Headers};

/// Queue argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its declaration options.
///
/// Queues are durable by default. When no dead-letter exchange is set, the
/// backoff path dead-letters through the bus default exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) message_ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
    pub(crate) max_length_bytes: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) arguments: Headers,
}

impl QueueDefinition {
    /// Creates a new durable queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The queue name, unique within the applied topology
    ///
    /// # Returns
    /// A durable, non-exclusive queue with no TTL, length limit or
    /// dead-letter target
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            arguments: Headers::default(),
        }
    }

    /// Returns the queue name.
    ///
    /// # Returns
    /// The name the queue is declared and consumed under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configured dead-letter exchange, if any.
    ///
    /// An empty name is returned as is; the backoff path treats it like an
    /// unset exchange.
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    /// Makes the queue transient, removed on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is gone.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Dead-letters expired or rejected messages to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - The exchange receiving dead-lettered messages
    /// * `routing_key` - The routing key they are republished with
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Dead-letters to `exchange`, keeping each message's own routing key.
    pub fn dead_letter_exchange_only(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = None;
        self
    }

    /// Adds a single raw declaration argument.
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Builds the `x-*` declaration arguments for this queue.
    ///
    /// # Returns
    /// The raw arguments added through [`QueueDefinition::argument`], overlaid
    /// with the TTL, length limits and dead-letter target
    pub fn declare_arguments(&self) -> Headers {
        let mut args = self.arguments.clone();

        if let Some(ttl) = self.message_ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl.into()));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::Int(max.into()));
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::Int(max.into()),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::String(exchange.clone()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::String(key.clone()),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
///
/// When `from_exchange` is unset the binding targets the bus default exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) from_exchange: Option<String>,
    pub(crate) to_queue: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for `queue` on `routing_key`.
    ///
    /// # Parameters
    /// * `queue` - The queue receiving routed messages
    /// * `routing_key` - An exact key, or a pattern using `*` for one segment
    ///   and `#` for zero or more
    pub fn new(queue: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            from_exchange: None,
            to_queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.from_exchange = Some(exchange.to_owned());
        self
    }

    /// Returns the bound queue name.
    pub fn queue(&self) -> &str {
        &self.to_queue
    }

    /// Returns the routing key or pattern.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Resolves the source exchange against the bus default.
    ///
    /// # Parameters
    /// * `default_exchange` - Exchange used when the binding names none
    ///
    /// # Returns
    /// The explicit exchange of this binding, or `default_exchange`
    pub fn source_exchange<'a>(&'a self, default_exchange: &'a str) -> &'a str {
        self.from_exchange.as_deref().unwrap_or(default_exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_arguments_include_dead_letter_target() {
        let def = QueueDefinition::new("test-queue-dead-letter-ttl")
            .ttl(2000)
            .dead_letter("amq.topic", "automation.run");

        let args = def.declare_arguments();
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::Int(2000)));
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("amq.topic"))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("automation.run"))
        );
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(QueueDefinition::new("test-queue-1").declare_arguments().is_empty());
    }

    #[test]
    fn binding_falls_back_to_default_exchange() {
        let binding = QueueBinding::new("test-queue-1", "automation.run");
        assert_eq!(binding.source_exchange("amq.topic"), "amq.topic");

        let binding = binding.exchange("exchange2");
        assert_eq!(binding.source_exchange("amq.topic"), "exchange2");
    }
}
