// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod backoff;
pub mod bootstrap;
pub mod broker;
pub mod bus;
pub mod channel;
pub mod config;
pub mod control_api;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod provisioner;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod session;
pub mod testing;
pub mod topology;

pub use bus::{ConsumerOptions, MessageBus, MessageBusBuilder};
pub use config::{BusEnv, ConnectionOptions, MessageBusConfig};
pub use consumer::{IncomingMessage, MessageHandler};
pub use dispatcher::{ConsumerHandle, ConsumerState};
pub use errors::{BusError, HandlerError};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use message::{Envelope, HeaderValue, Headers, MessageProperties, Payload, PublishOptions};
pub use queue::{QueueBinding, QueueDefinition};
pub use topology::{AppliedTopology, TopologyConfig};
