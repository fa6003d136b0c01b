// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides the installer for exchanges, queues and the bindings
//! between them. The dispatcher uses it twice: once to declare the shared
//! topic exchange and once per registered queue to declare the queue and bind
//! it to each of its topics. Every declaration is idempotent on the broker,
//! so installing the same topology again after a consumer fault is safe.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the broker.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Collects exchanges, queues and bindings and installs them in that order.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates an empty topology installed over `channel`.
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    ///
    /// The first failure aborts the installation.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            info!(exchange = exch.name.as_str(), "exchange declared");
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel.declare_queue(def).await?;
            info!(queue = def.name.as_str(), "queue declared");
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.bind(binding).await?;
            info!(
                queue = binding.queue_name.as_str(),
                routing_key = binding.routing_key.as_str(),
                "queue bound"
            );
        }

        Ok(())
    }
}
