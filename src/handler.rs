// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Handlers are registered per queue and per topic in a [`ConsumerTable`].
//! The dispatcher owns the table once `listen` is called, so it cannot be
//! changed while consumers are running.

use crate::errors::AmqpError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{
    collections::{hash_map, HashMap},
    sync::Arc,
};
use thiserror::Error;

/// Error returned by a [`ConsumerHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The delivery could not be processed; it is dropped and the queue
    /// keeps consuming.
    #[error("{0}")]
    Failed(String),

    /// The consumer is in a state it cannot continue from; every consumer is
    /// torn down and the consumer table is installed again.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn failed(reason: impl ToString) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    pub fn fatal(reason: impl ToString) -> Self {
        HandlerError::Fatal(reason.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// A delivery as seen by a handler: the body is already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub topic: String,
    pub correlation_id: String,
    pub data: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// Deserializes the JSON body into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// Processes the messages of one topic.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Handlers by queue name, then by topic (routing key).
#[derive(Clone, Default)]
pub struct ConsumerTable {
    queues: HashMap<String, HashMap<String, Arc<dyn ConsumerHandler>>>,
}

impl ConsumerTable {
    pub fn new() -> ConsumerTable {
        ConsumerTable::default()
    }

    /// Registers `handler` for messages published with `topic` and received
    /// on `queue`. Registering the same pair again replaces the handler.
    ///
    /// # Parameters
    /// * `queue` - Queue the handler consumes from
    /// * `topic` - Binding key of the queue and lookup key of the handler
    /// * `handler` - Handler invoked for each matching delivery
    ///
    /// # Returns
    /// The table, for chaining further registrations
    pub fn register(
        mut self,
        queue: &str,
        topic: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.queues
            .entry(queue.to_owned())
            .or_default()
            .insert(topic.to_owned(), handler);
        self
    }

    /// Looks up the handler of a delivery by exact routing key.
    ///
    /// # Parameters
    /// * `queue` - Queue the delivery was received on
    /// * `topic` - Routing key the message was published with
    ///
    /// # Returns
    /// The registered handler, or `None` when the pair is unknown; wildcard
    /// binding keys never match a concrete routing key here
    pub fn handler(&self, queue: &str, topic: &str) -> Option<&Arc<dyn ConsumerHandler>> {
        self.queues.get(queue).and_then(|topics| topics.get(topic))
    }

    pub fn queues(&self) -> hash_map::Keys<'_, String, HashMap<String, Arc<dyn ConsumerHandler>>> {
        self.queues.keys()
    }

    pub fn topics<'a>(&'a self, queue: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.queues
            .get(queue)
            .into_iter()
            .flat_map(|topics| topics.keys().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
