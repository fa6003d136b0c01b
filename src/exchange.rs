// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides the exchange definition used when installing the
//! topology. Publishers and consumers of this crate share one topic
//! exchange: a message reaches every queue bound with a routing key that
//! matches the one it was published with.

/// Definition of the RabbitMQ topic exchange messages are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable topic exchange definition.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition; chain [`ExchangeDefinition::durable`] to
    /// keep it across broker restarts
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_exchange_is_transient() {
        let def = ExchangeDefinition::new("events");

        assert_eq!(def.name(), "events");
        assert!(!def.is_durable());
        assert!(ExchangeDefinition::new("events").durable().is_durable());
    }
}
