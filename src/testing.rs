// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recent Message Buffers
//!
//! In test environments the bus keeps the last published, consumed and
//! rejected messages so tests can assert on traffic without their own
//! bookkeeping.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// Number of messages kept per buffer
pub const LAST_MESSAGES_BUFFER_SIZE: usize = 100;

/// A message as recorded in a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMessage {
    pub key: String,
    pub body: Value,
}

#[derive(Default)]
struct Buffer {
    messages: Mutex<VecDeque<RecordedMessage>>,
}

impl Buffer {
    fn push(&self, key: &str, body: Value) {
        let mut messages = self.messages.lock();
        messages.push_back(RecordedMessage {
            key: key.to_owned(),
            body,
        });
        while messages.len() > LAST_MESSAGES_BUFFER_SIZE {
            messages.pop_front();
        }
    }

    fn get(&self) -> Vec<RecordedMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    fn clear(&self) -> usize {
        let mut messages = self.messages.lock();
        let count = messages.len();
        messages.clear();
        count
    }
}

/// Bounded buffers of the most recent bus traffic, oldest evicted first.
#[derive(Default)]
pub struct MessageLog {
    published: Buffer,
    consumed: Buffer,
    rejected: Buffer,
}

impl MessageLog {
    pub fn new() -> MessageLog {
        MessageLog::default()
    }

    pub(crate) fn record_published(&self, key: &str, body: Value) {
        self.published.push(key, body);
    }

    pub(crate) fn record_consumed(&self, key: &str, body: Value) {
        self.consumed.push(key, body);
    }

    pub(crate) fn record_rejected(&self, key: &str, body: Value) {
        self.rejected.push(key, body);
    }

    pub fn published(&self) -> Vec<RecordedMessage> {
        self.published.get()
    }

    pub fn consumed(&self) -> Vec<RecordedMessage> {
        self.consumed.get()
    }

    pub fn rejected(&self) -> Vec<RecordedMessage> {
        self.rejected.get()
    }

    /// Empties every buffer and returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        self.published.clear() + self.consumed.clear() + self.rejected.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_only_the_most_recent_messages() {
        let log = MessageLog::new();
        for n in 0..(LAST_MESSAGES_BUFFER_SIZE + 5) {
            log.record_published("automation.run", json!({ "n": n }));
        }

        let published = log.published();
        assert_eq!(published.len(), LAST_MESSAGES_BUFFER_SIZE);
        assert_eq!(published[0].body, json!({ "n": 5 }));
        assert!(log.consumed().is_empty());
    }

    #[test]
    fn clear_empties_every_buffer() {
        let log = MessageLog::new();
        log.record_published("a", json!(1));
        log.record_consumed("b", json!(2));
        log.record_rejected("c", json!(3));

        assert_eq!(log.clear(), 3);
        assert!(log.published().is_empty());
        assert!(log.rejected().is_empty());
    }
}
