// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Abstraction
//!
//! The publisher and the dispatcher only talk to the broker through the
//! [`BrokerChannel`] trait. The production implementation lives in
//! [`crate::channel`] and wraps a `lapin` connection; tests plug in mocks or
//! an in-memory broker.
//!
//! Implementations must be safe for concurrent use: the publisher and every
//! per-queue dispatch loop share one channel.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, fmt, sync::Arc};

/// Stream of deliveries of one consumer. It ends when the consumer is
/// cancelled or the channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Message handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub content_type: String,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Settles a delivery on the broker when consuming in manual ack mode.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgement; `requeue` puts the message back on its queue.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
#[derive(Clone, Default)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Present only when the consumer was opened without auto-ack.
    pub acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(routing_key: &str, correlation_id: &str, body: Vec<u8>) -> Delivery {
        Delivery {
            routing_key: routing_key.to_owned(),
            correlation_id: correlation_id.to_owned(),
            body,
            ..Default::default()
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// The broker operations the client relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange; declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue; declaring an existing queue is a no-op.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Opens a consumer on `queue`. With `no_ack` the broker auto-acks and
    /// deliveries carry no acknowledger.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Cancels a consumer opened by [`BrokerChannel::consume`], ending its stream.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
