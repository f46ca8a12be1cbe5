// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Broker-agnostic message types: header values, basic properties, the
//! outgoing [`Envelope`] and the decoded [`Payload`] handed to handlers.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Content type attached to every message published by the bus
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Message header table.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header (or queue argument) value.
///
/// Mirrors the subset of AMQP field values the bus reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    /// Reads the value as a signed integer.
    ///
    /// Strings are parsed leniently (surrounding whitespace is ignored) since
    /// other clients are free to send numeric headers as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::UInt(v) => i64::try_from(*v).ok(),
            HeaderValue::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            HeaderValue::String(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the value if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::UInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Basic properties carried with every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: Headers,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// The AMQP `type` property
    pub kind: Option<String>,
    /// Delivery mode 2 when set
    pub persistent: bool,
}

/// Per-publish options shared by exchange and direct-to-queue publishing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub headers: Headers,
    pub persistent: bool,
    pub message_type: Option<String>,
}

impl PublishOptions {
    /// Adds a message header.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - Anything convertible into a [`HeaderValue`]
    ///
    /// # Returns
    /// The options with the header set, replacing any previous value
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Asks the broker to persist the message to disk.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Sets the AMQP `type` property.
    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }
}

/// A message to publish through an exchange.
///
/// The body is serialized as JSON text. When `exchange` is unset the bus
/// publishes to its default exchange.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub key: String,
    pub body: T,
    pub exchange: Option<String>,
    pub options: PublishOptions,
}

impl<T> Envelope<T> {
    /// Creates an envelope for the default exchange.
    ///
    /// # Parameters
    /// * `key` - The routing key
    /// * `body` - The payload, serialized as JSON when published
    pub fn new(key: &str, body: T) -> Self {
        Envelope {
            key: key.to_owned(),
            body,
            exchange: None,
            options: PublishOptions::default(),
        }
    }

    /// Publishes through `exchange` instead of the default exchange.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    /// Adds a message header.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - Anything convertible into a [`HeaderValue`]
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.options.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Replaces every publish option, headers included.
    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// Body of a received message.
///
/// Bodies are decoded as JSON when possible; anything else is passed through
/// untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(Vec<u8>),
}

impl Payload {
    /// Decodes a message body.
    ///
    /// # Parameters
    /// * `data` - The raw body bytes
    ///
    /// # Returns
    /// [`Payload::Json`] when `data` parses as JSON, [`Payload::Raw`] with the
    /// original bytes otherwise
    pub fn decode(data: &[u8]) -> Payload {
        match serde_json::from_slice(data) {
            Ok(value) => Payload::Json(value),
            Err(_) => {
                debug!(
                    size = data.len(),
                    "unable to parse JSON from the message, returning original data"
                );
                Payload::Raw(data.to_vec())
            }
        }
    }

    /// Returns the decoded JSON value, if the body was JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Returns the raw bytes of a body that was not JSON.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Raw(data) => Some(data),
        }
    }

    /// Deserializes the payload into a typed body.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => T::deserialize(value),
            Payload::Raw(data) => serde_json::from_slice(data),
        }
    }

    /// JSON view used by the recent-message buffers.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Raw(data) => Value::String(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn decodes_json_bodies() {
        let payload = Payload::decode(br#"{"pipelineId":"a","stepId":"start"}"#);
        assert_eq!(
            payload.as_json(),
            Some(&json!({"pipelineId": "a", "stepId": "start"}))
        );
    }

    #[test]
    fn passes_raw_bytes_through_when_not_json() {
        let payload = Payload::decode(b"\x00not json");
        assert_eq!(payload, Payload::Raw(b"\x00not json".to_vec()));
        assert!(payload.as_json().is_none());
    }

    #[test]
    fn deserializes_into_typed_bodies() {
        #[derive(Deserialize, Debug, PartialEq)]
        #[serde(rename_all = "camelCase")]
        struct Step {
            pipeline_id: String,
            step_id: String,
        }

        let payload = Payload::decode(br#"{"pipelineId":"a","stepId":"start"}"#);
        let step: Step = payload.deserialize().unwrap();
        assert_eq!(
            step,
            Step {
                pipeline_id: "a".into(),
                step_id: "start".into()
            }
        );
    }

    #[test]
    fn reads_integer_headers_leniently() {
        assert_eq!(HeaderValue::Int(4000).as_i64(), Some(4000));
        assert_eq!(HeaderValue::UInt(16000).as_i64(), Some(16000));
        assert_eq!(HeaderValue::from(" 1000 ").as_i64(), Some(1000));
        assert_eq!(HeaderValue::from("abc").as_i64(), None);
        assert_eq!(HeaderValue::Bool(true).as_i64(), None);
    }
}
