// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declarative exchange, queue and binding definitions applied against a
//! broker channel. Application is idempotent across the lifetime of a bus:
//! every item successfully asserted is appended to [`AppliedTopology`], and a
//! later `apply` skips anything already recorded there.
//!
//! The main components are:
//! - [`TopologyConfig`]: a batch of definitions to apply
//! - [`AppliedTopology`]: append-only record of what was asserted
//! - [`TopologyConfigurator`]: applies batches in exchange, queue, binding order

use crate::{
    broker::Broker,
    errors::BusError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// A batch of topology definitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyConfig {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologyConfig {
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

/// A binding as it was asserted, with its source exchange resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppliedBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Everything asserted by one bus since it started, in assertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedTopology {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<AppliedBinding>,
}

impl AppliedTopology {
    /// Number of assertions recorded.
    pub fn len(&self) -> usize {
        self.exchanges.len() + self.queues.len() + self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|def| def.name == name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|def| def.name.clone()).collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.iter().any(|def| def.name == name)
    }

    fn has_binding(&self, binding: &AppliedBinding) -> bool {
        self.bindings.contains(binding)
    }
}

/// Applies topology batches against one broker handle.
pub struct TopologyConfigurator {
    broker: Arc<dyn Broker>,
    default_exchange: String,
    default_config: TopologyConfig,
    applied: RwLock<AppliedTopology>,
    apply_lock: Mutex<()>,
}

impl TopologyConfigurator {
    /// Creates a configurator that prepends `default_config` to every batch
    /// and binds to `default_exchange` when a binding names no exchange.
    pub fn new(
        broker: Arc<dyn Broker>,
        default_exchange: &str,
        default_config: TopologyConfig,
    ) -> TopologyConfigurator {
        TopologyConfigurator {
            broker,
            default_exchange: default_exchange.to_owned(),
            default_config,
            applied: RwLock::new(AppliedTopology::default()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Snapshot of everything applied so far.
    pub fn applied(&self) -> AppliedTopology {
        self.applied.read().clone()
    }

    /// Applies the default topology followed by `config`.
    ///
    /// Exchanges are asserted before queues, and queues before bindings.
    /// Items already recorded in the applied topology are skipped. The first
    /// failing assertion aborts the batch; items asserted before it stay
    /// recorded.
    pub async fn apply(&self, config: &TopologyConfig) -> Result<(), BusError> {
        let _serialized = self.apply_lock.lock().await;

        let exchanges = self.default_config.exchanges.iter().chain(&config.exchanges);
        for def in exchanges {
            self.assert_exchange(def).await?;
        }

        let queues = self.default_config.queues.iter().chain(&config.queues);
        for def in queues {
            self.assert_queue(def).await?;
        }

        let bindings = self.default_config.bindings.iter().chain(&config.bindings);
        for binding in bindings {
            self.bind_queue(binding).await?;
        }

        Ok(())
    }

    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        if def.name.is_empty() {
            debug!("skipping the nameless default exchange");
            return Ok(());
        }

        if self.applied.read().has_exchange(&def.name) {
            debug!("exchange: {} was already asserted", def.name);
            return Ok(());
        }

        debug!("asserting exchange: {}", def.name);
        if let Err(err) = self.broker.declare_exchange(def).await {
            error!(
                error = err.to_string(),
                exchange = ?def,
                "failed to assert exchange"
            );
            return Err(err);
        }

        self.applied.write().exchanges.push(def.clone());
        debug!("exchange: {} was asserted", def.name);

        Ok(())
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<(), BusError> {
        if self.applied.read().queue(&def.name).is_some() {
            debug!("queue: {} was already asserted", def.name);
            return Ok(());
        }

        debug!("asserting queue: {}", def.name);
        if let Err(err) = self.broker.declare_queue(def).await {
            error!(error = err.to_string(), queue = ?def, "failed to assert queue");
            return Err(err);
        }

        self.applied.write().queues.push(def.clone());
        debug!("queue: {} was asserted", def.name);

        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), BusError> {
        let applied = AppliedBinding {
            exchange: binding.source_exchange(&self.default_exchange).to_owned(),
            queue: binding.to_queue.clone(),
            routing_key: binding.routing_key.clone(),
        };

        if self.applied.read().has_binding(&applied) {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            applied.queue, applied.exchange, applied.routing_key
        );

        if let Err(err) = self
            .broker
            .bind_queue(&applied.queue, &applied.exchange, &applied.routing_key)
            .await
        {
            error!(
                error = err.to_string(),
                binding = ?binding,
                "failed to bind queue to exchange"
            );
            return Err(err);
        }

        self.applied.write().bindings.push(applied);

        Ok(())
    }
}
