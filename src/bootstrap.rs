// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bootstrap Barrier
//!
//! Two single-fire gates sequencing bus startup:
//! - the configuration gate opens when the caller supplies its static
//!   configuration, before any broker round-trip;
//! - the ready gate opens once topology has been applied to a live channel,
//!   carrying either the ready runtime or the setup error.
//!
//! Waiters on a gate that never opens wait forever.

use crate::errors::BusError;
use std::sync::Arc;
use tokio::sync::watch;

type ReadyOutcome<R> = Result<Arc<R>, BusError>;

pub struct BootstrapBarrier<C, R> {
    config: watch::Sender<Option<Arc<C>>>,
    ready: watch::Sender<Option<ReadyOutcome<R>>>,
    // keep both channels open with no other receiver alive
    _config_rx: watch::Receiver<Option<Arc<C>>>,
    _ready_rx: watch::Receiver<Option<ReadyOutcome<R>>>,
}

impl<C, R> Default for BootstrapBarrier<C, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, R> BootstrapBarrier<C, R> {
    pub fn new() -> BootstrapBarrier<C, R> {
        let (config, _config_rx) = watch::channel(None);
        let (ready, _ready_rx) = watch::channel(None);

        BootstrapBarrier {
            config,
            ready,
            _config_rx,
            _ready_rx,
        }
    }

    /// Opens the configuration gate. Returns `false` if it was already open;
    /// the first configuration wins.
    pub fn settle_config(&self, config: C) -> bool {
        let mut config = Some(Arc::new(config));
        self.config.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = config.take();
            true
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.borrow().is_some()
    }

    /// Waits for the configuration gate.
    pub async fn config(&self) -> Arc<C> {
        let mut rx = self.config.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(config) = current {
                return config;
            }
            if rx.changed().await.is_err() {
                // the sender lives as long as self
                std::future::pending::<()>().await;
            }
        }
    }

    /// Opens the ready gate. Returns `false` if it was already open.
    pub fn settle_ready(&self, outcome: ReadyOutcome<R>) -> bool {
        let mut outcome = Some(outcome);
        self.ready.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// Waits for the ready gate.
    pub async fn ready(&self) -> ReadyOutcome<R> {
        let mut rx = self.ready.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The ready outcome, if the gate is open. Never waits.
    pub fn peek_ready(&self) -> Option<ReadyOutcome<R>> {
        self.ready.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn waiters_block_until_configured() {
        let barrier = Arc::new(BootstrapBarrier::<String, ()>::new());
        assert!(!barrier.is_configured());

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.config().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        assert!(barrier.settle_config("first".into()));
        assert!(!barrier.settle_config("second".into()));

        assert_eq!(*waiter.await.unwrap(), "first");
        assert_eq!(*barrier.config().await, "first");
        assert!(barrier.is_configured());
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_gates_wait_forever() {
        let barrier = BootstrapBarrier::<(), ()>::new();
        assert!(timeout(Duration::from_secs(3600), barrier.config())
            .await
            .is_err());
        assert!(timeout(Duration::from_secs(3600), barrier.ready())
            .await
            .is_err());
        assert!(barrier.peek_ready().is_none());
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_outcome() {
        let barrier = BootstrapBarrier::<(), u32>::new();
        assert!(barrier.settle_ready(Err(BusError::Closed)));
        assert!(!barrier.settle_ready(Ok(Arc::new(1))));

        assert_eq!(barrier.ready().await.unwrap_err(), BusError::Closed);
        assert_eq!(barrier.ready().await.unwrap_err(), BusError::Closed);
        assert!(matches!(barrier.peek_ready(), Some(Err(BusError::Closed))));
    }
}
