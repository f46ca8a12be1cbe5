// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local [`Broker`] with the AMQP semantics the bus relies on:
//! exchange routing (direct, topic, fanout, headers), per-consumer prefetch,
//! ack/nack with requeue, message TTL with dead-lettering, and precondition
//! failures on inequivalent redeclaration. It lets the whole reliability layer
//! run deterministically under a paused tokio clock.
//!
//! Connections behave like AMQP ones. A failed declaration, binding or
//! publish closes the connection's shared channel, which is reopened on its
//! next use; consumers sit on their own channels and are unaffected. Dropping
//! a connection ends its consumers and requeues their unacknowledged
//! deliveries.

use crate::{
    broker::{Acknowledger, Broker, Connector, Delivery, DeliveryStream},
    errors::BusError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Headers, MessageProperties},
    queue::QueueDefinition,
    routing::topic_matches,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Header the broker stamps on dead-lettered messages
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";

/// Counters exposed for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub exchange_declarations: u32,
    pub queue_declarations: u32,
    pub bindings: u32,
    pub published: u32,
    pub acked: u32,
    pub nacked: u32,
    pub dead_lettered: u32,
    pub dropped: u32,
    pub connections_opened: u32,
    pub channels_reopened: u32,
}

#[derive(Clone)]
struct StoredMessage {
    id: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    data: Vec<u8>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (StoredMessage, String)>,
    consumers: Vec<String>,
    next_consumer: usize,
}

struct ConsumerState {
    queue: String,
    prefetch: Option<u16>,
    in_flight: usize,
    connection: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct ConnectionState {
    id: u64,
    up: watch::Sender<bool>,
    channel_open: AtomicBool,
}

impl ConnectionState {
    fn new(id: u64) -> ConnectionState {
        ConnectionState {
            id,
            up: watch::Sender::new(true),
            channel_open: AtomicBool::new(true),
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, ConsumerState>,
    connections: Vec<Weak<ConnectionState>>,
    next_connection: u64,
    next_delivery_tag: u64,
    next_message_id: u64,
    stats: BrokerStats,
}

type SharedState = Arc<Mutex<State>>;

/// In-process broker. Clones share the same state and the same connection.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: SharedState,
    connection: Arc<ConnectionState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with the built-in `amq.*` exchanges pre-declared.
    pub fn new() -> InMemoryBroker {
        let mut state = State::default();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.headers", ExchangeKind::Headers),
        ] {
            state
                .exchanges
                .insert(name.to_owned(), ExchangeDefinition::new(name).kind(kind));
        }

        InMemoryBroker {
            state: Arc::new(Mutex::new(state)),
            connection: Arc::new(ConnectionState::new(0)),
        }
    }

    /// Opens another connection to the same broker state.
    pub fn open_connection(&self) -> InMemoryBroker {
        let mut state = self.state.lock();
        state.next_connection += 1;
        state.stats.connections_opened += 1;

        let connection = Arc::new(ConnectionState::new(state.next_connection));
        state.connections.retain(|weak| weak.strong_count() > 0);
        state.connections.push(Arc::downgrade(&connection));

        InMemoryBroker {
            state: self.state.clone(),
            connection,
        }
    }

    /// Drops every connection opened through [`InMemoryBroker::open_connection`],
    /// as a broker restart would. Exchanges, queues, bindings and ready
    /// messages survive.
    pub fn drop_connections(&self) {
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let connections: Vec<Arc<ConnectionState>> = state
            .connections
            .drain(..)
            .filter_map(|connection| connection.upgrade())
            .collect();
        for connection in connections {
            close_connection(state, &weak, &connection);
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    /// Number of ready (not yet delivered) messages in `queue`.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unsettled messages in `queue`.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<Headers> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.def.declare_arguments())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Simulates this connection dropping.
    pub fn disconnect(&self) {
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.state.lock();
        close_connection(&mut guard, &weak, &self.connection);
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if *self.connection.up.borrow() {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    /// Makes sure the shared channel is usable, reopening it after a failure.
    fn shared_channel(&self, state: &mut State) -> Result<(), BusError> {
        self.ensure_connected()?;
        if !self.connection.channel_open.swap(true, Ordering::SeqCst) {
            debug!(connection = self.connection.id, "reopening the shared channel");
            state.stats.channels_reopened += 1;
        }
        Ok(())
    }

    /// Closes the shared channel, as the broker does on a channel-level error.
    fn channel_error(&self, err: BusError) -> BusError {
        debug!(
            error = err.to_string(),
            connection = self.connection.id,
            "shared channel closed by the broker"
        );
        self.connection.channel_open.store(false, Ordering::SeqCst);
        err
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        if def.name.is_empty() {
            return Err(self.channel_error(BusError::DeclareExchangeError {
                name: def.name.clone(),
                reason: "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            }));
        }

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(self.channel_error(BusError::DeclareExchangeError {
                    name: def.name.clone(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        def.name
                    ),
                }))
            }
            Some(_) => {
                state.stats.exchange_declarations += 1;
                Ok(())
            }
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                state.stats.exchange_declarations += 1;
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        match state.queues.get(&def.name) {
            Some(existing) if &existing.def != def => {
                Err(self.channel_error(BusError::DeclareQueueError {
                    name: def.name.clone(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        def.name
                    ),
                }))
            }
            Some(_) => {
                state.stats.queue_declarations += 1;
                Ok(())
            }
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: vec![],
                        next_consumer: 0,
                    },
                );
                state.stats.queue_declarations += 1;
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        let failure = |reason: String| {
            self.channel_error(BusError::BindingExchangeToQueueError {
                exchange: exchange.to_owned(),
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
                reason,
            })
        };

        if !state.queues.contains_key(queue) {
            return Err(failure(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(failure(format!("NOT_FOUND - no exchange '{exchange}'")));
        }

        let binding = (exchange.to_owned(), queue.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        state.stats.bindings += 1;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        let targets =
            route(state, exchange, routing_key).map_err(|err| self.channel_error(err))?;
        state.stats.published += 1;
        state.next_message_id += 1;

        let message = StoredMessage {
            id: state.next_message_id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: properties.clone(),
            data: body.to_vec(),
        };

        for queue in targets {
            enqueue(state, &weak, &queue, message.clone());
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, BusError> {
        self.ensure_connected()?;
        let weak = Arc::downgrade(&self.state);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let failure = |reason: String| BusError::ConsumerDeclarationError {
            queue: queue.to_owned(),
            reason,
        };

        if state.consumers.contains_key(consumer_tag) {
            return Err(failure(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
            )));
        }
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(failure(format!("NOT_FOUND - no queue '{queue}'")));
        };
        queue_state.consumers.push(consumer_tag.to_owned());

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.insert(
            consumer_tag.to_owned(),
            ConsumerState {
                queue: queue.to_owned(),
                prefetch,
                in_flight: 0,
                connection: self.connection.id,
                sender,
            },
        );

        dispatch(state, &weak, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        remove_consumer(state, consumer_tag);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        match state.queues.get_mut(queue) {
            Some(queue_state) => {
                let count = queue_state.ready.len();
                queue_state.ready.clear();
                Ok(count as u32)
            }
            None => Err(self.channel_error(BusError::PurgeQueueError {
                queue: queue.to_owned(),
                reason: format!("NOT_FOUND - no queue '{queue}'"),
            })),
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.shared_channel(state)?;

        let Some(queue_state) = state.queues.remove(queue) else {
            return Ok(0);
        };

        for tag in &queue_state.consumers {
            state.consumers.remove(tag);
        }
        state.bindings.retain(|(_, bound, _)| bound != queue);

        Ok(queue_state.ready.len() as u32)
    }

    fn is_connected(&self) -> bool {
        *self.connection.up.borrow()
    }

    async fn disconnected(&self) {
        let mut up = self.connection.up.subscribe();
        // the sender lives as long as self
        let _ = up.wait_for(|up| !*up).await;
    }

    async fn close(&self) -> Result<(), BusError> {
        self.disconnect();
        Ok(())
    }
}

/// Marks `connection` down, ends its consumers and requeues what they held.
fn close_connection(state: &mut State, weak: &Weak<Mutex<State>>, connection: &ConnectionState) {
    connection.up.send_replace(false);

    let tags: Vec<String> = state
        .consumers
        .iter()
        .filter(|(_, consumer)| consumer.connection == connection.id)
        .map(|(tag, _)| tag.clone())
        .collect();
    if tags.is_empty() {
        return;
    }

    let mut touched = vec![];
    for tag in &tags {
        if let Some(consumer) = state.consumers.get(tag) {
            if !touched.contains(&consumer.queue) {
                touched.push(consumer.queue.clone());
            }
        }
        remove_consumer(state, tag);
    }

    for queue in &touched {
        let Some(queue_state) = state.queues.get_mut(queue) else {
            continue;
        };

        let mut held: Vec<u64> = queue_state
            .unacked
            .iter()
            .filter(|(_, (_, owner))| tags.contains(owner))
            .map(|(delivery_tag, _)| *delivery_tag)
            .collect();
        held.sort_unstable_by(|a, b| b.cmp(a));

        for delivery_tag in held {
            if let Some((mut message, _)) = queue_state.unacked.remove(&delivery_tag) {
                message.redelivered = true;
                queue_state.ready.push_front(message);
            }
        }

        dispatch(state, weak, queue);
    }

    debug!(
        connection = connection.id,
        consumers = tags.len(),
        "connection closed"
    );
}

/// Resolves the queues an exchange routes `routing_key` to.
fn route(state: &State, exchange: &str, routing_key: &str) -> Result<Vec<String>, BusError> {
    if exchange.is_empty() {
        return Ok(state
            .queues
            .contains_key(routing_key)
            .then(|| routing_key.to_owned())
            .into_iter()
            .collect());
    }

    let Some(def) = state.exchanges.get(exchange) else {
        return Err(BusError::ChannelError(format!(
            "NOT_FOUND - no exchange '{exchange}'"
        )));
    };

    let mut targets: Vec<String> = vec![];
    for (bound_exchange, queue, pattern) in &state.bindings {
        if bound_exchange != exchange || targets.contains(queue) {
            continue;
        }

        let matched = match def.kind {
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
        };

        if matched {
            targets.push(queue.clone());
        }
    }

    Ok(targets)
}

fn enqueue(state: &mut State, weak: &Weak<Mutex<State>>, queue: &str, message: StoredMessage) {
    let Some(queue_state) = state.queues.get_mut(queue) else {
        return;
    };

    if let Some(ttl) = queue_state.def.message_ttl {
        let weak = weak.clone();
        let queue = queue.to_owned();
        let id = message.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl.into())).await;
            expire(&weak, &queue, id);
        });
    }

    queue_state.ready.push_back(message);
    dispatch(state, weak, queue);
}

fn expire(weak: &Weak<Mutex<State>>, queue: &str, id: u64) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut guard = shared.lock();
    let state = &mut *guard;

    let Some(queue_state) = state.queues.get_mut(queue) else {
        return;
    };
    let Some(position) = queue_state.ready.iter().position(|m| m.id == id) else {
        return;
    };
    let Some(message) = queue_state.ready.remove(position) else {
        return;
    };

    dead_letter(state, weak, queue, message, "expired");
}

fn dead_letter(
    state: &mut State,
    weak: &Weak<Mutex<State>>,
    queue: &str,
    mut message: StoredMessage,
    reason: &str,
) {
    let target = state.queues.get(queue).and_then(|q| {
        q.def.dead_letter_exchange.clone().map(|exchange| {
            let key = q
                .def
                .dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| message.routing_key.clone());
            (exchange, key)
        })
    });

    let Some((exchange, routing_key)) = target else {
        debug!(queue, reason, "dropping message without a dead-letter target");
        state.stats.dropped += 1;
        return;
    };

    let (origin_exchange, origin_key) = (message.exchange.clone(), message.routing_key.clone());
    record_death(
        &mut message.properties.headers,
        queue,
        reason,
        &origin_exchange,
        &origin_key,
    );

    let targets = match route(state, &exchange, &routing_key) {
        Ok(targets) => targets,
        Err(err) => {
            debug!(error = err.to_string(), queue, "dead-letter exchange unroutable");
            state.stats.dropped += 1;
            return;
        }
    };

    state.stats.dead_lettered += 1;
    state.next_message_id += 1;
    message.id = state.next_message_id;
    message.exchange = exchange;
    message.routing_key = routing_key;
    message.redelivered = false;

    for target in targets {
        enqueue(state, weak, &target, message.clone());
    }
}

fn record_death(
    headers: &mut Headers,
    queue: &str,
    reason: &str,
    exchange: &str,
    routing_key: &str,
) {
    let mut deaths = match headers.remove(AMQP_HEADERS_X_DEATH) {
        Some(HeaderValue::Array(deaths)) => deaths,
        _ => vec![],
    };

    let existing = deaths.iter_mut().find_map(|death| match death {
        HeaderValue::Table(table)
            if table.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && table.get("reason").and_then(HeaderValue::as_str) == Some(reason) =>
        {
            Some(table)
        }
        _ => None,
    });

    match existing {
        Some(table) => {
            let count = table.get("count").and_then(HeaderValue::as_i64).unwrap_or(0);
            table.insert("count".into(), HeaderValue::Int(count + 1));
        }
        None => {
            let mut table = Headers::new();
            table.insert("count".into(), HeaderValue::Int(1));
            table.insert("reason".into(), reason.into());
            table.insert("queue".into(), queue.into());
            table.insert("exchange".into(), exchange.into());
            table.insert(
                "routing-keys".into(),
                HeaderValue::Array(vec![routing_key.into()]),
            );
            deaths.insert(0, HeaderValue::Table(table));
        }
    }

    headers.insert(AMQP_HEADERS_X_DEATH.into(), HeaderValue::Array(deaths));
}

/// Hands ready messages to consumers with spare prefetch capacity, round-robin.
fn dispatch(state: &mut State, weak: &Weak<Mutex<State>>, queue: &str) {
    loop {
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return;
        };
        if queue_state.ready.is_empty() || queue_state.consumers.is_empty() {
            return;
        }

        let total = queue_state.consumers.len();
        let chosen = (0..total)
            .map(|offset| (queue_state.next_consumer + offset) % total)
            .find(|index| {
                state
                    .consumers
                    .get(&queue_state.consumers[*index])
                    .is_some_and(|c| c.prefetch.map_or(true, |p| c.in_flight < usize::from(p)))
            });
        let Some(index) = chosen else {
            return;
        };

        queue_state.next_consumer = (index + 1) % total;
        let tag = queue_state.consumers[index].clone();
        let Some(message) = queue_state.ready.pop_front() else {
            return;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let delivery = Delivery::new(
            delivery_tag,
            &message.exchange,
            &message.routing_key,
            message.redelivered,
            message.properties.clone(),
            message.data.clone(),
            Arc::new(MemoryAcker {
                state: weak.clone(),
                queue: queue.to_owned(),
                delivery_tag,
            }),
        );

        let sent = state
            .consumers
            .get_mut(&tag)
            .map(|consumer| {
                consumer.in_flight += 1;
                consumer.sender.send(delivery).is_ok()
            })
            .unwrap_or(false);

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return;
        };
        if sent {
            queue_state.unacked.insert(delivery_tag, (message, tag));
        } else {
            queue_state.ready.push_front(message);
            remove_consumer(state, &tag);
        }
    }
}

fn remove_consumer(state: &mut State, tag: &str) {
    if let Some(consumer) = state.consumers.remove(tag) {
        if let Some(queue_state) = state.queues.get_mut(&consumer.queue) {
            queue_state.consumers.retain(|t| t != tag);
            queue_state.next_consumer = 0;
        }
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, state: &mut State) -> Option<StoredMessage> {
        let (message, tag) = state
            .queues
            .get_mut(&self.queue)?
            .unacked
            .remove(&self.delivery_tag)?;

        if let Some(consumer) = state.consumers.get_mut(&tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        Some(message)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let shared = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut guard = shared.lock();
        let state = &mut *guard;

        if self.settle(state).is_none() {
            return Err(BusError::AckMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            )));
        }

        state.stats.acked += 1;
        dispatch(state, &self.state, &self.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let shared = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut guard = shared.lock();
        let state = &mut *guard;

        let Some(mut message) = self.settle(state) else {
            return Err(BusError::NackMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            )));
        };

        state.stats.nacked += 1;
        if requeue {
            message.redelivered = true;
            if let Some(queue_state) = state.queues.get_mut(&self.queue) {
                queue_state.ready.push_front(message);
            }
        } else {
            dead_letter(state, &self.state, &self.queue, message, "rejected");
        }

        dispatch(state, &self.state, &self.queue);
        Ok(())
    }
}

/// Connector opening a new connection to the same in-memory broker on every
/// connect.
///
/// It can be told to fail a number of attempts first, and it records the
/// URLs it was asked to connect to.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failures_remaining: Arc<AtomicU32>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> InMemoryConnector {
        InMemoryConnector {
            broker,
            failures_remaining: Arc::new(AtomicU32::new(0)),
            urls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Makes the next `attempts` connects fail.
    pub fn fail_first(self, attempts: u32) -> Self {
        self.failures_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BusError> {
        self.urls.lock().push(url.to_owned());

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BusError::ConnectionError("connection refused".into()));
        }

        Ok(Arc::new(self.broker.open_connection()))
    }
}
