// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing nodes messages are published to. This module
//! defines the supported exchange kinds and a builder for declarative
//! exchange definitions consumed by the topology configurator.

use crate::{
    errors::BusError,
    message::{HeaderValue, Headers},
};
use std::{fmt, str::FromStr};

/// Represents the types of exchanges the bus can assert.
///
/// - Direct: routes on an exact routing key match
/// - Topic: routes on routing key patterns (`*` one segment, `#` zero or more)
/// - Fanout: broadcasts to every bound queue
/// - Headers: routes on header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(BusError::InvalidExchangeKind(other.to_owned())),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange with its declaration options.
///
/// Exchanges are durable by default, matching what most brokers pre-declare
/// for their built-in `amq.*` exchanges.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) arguments: Headers,
}

impl ExchangeDefinition {
    /// Creates a new topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: Headers::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Makes the exchange transient, removed on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }
}
