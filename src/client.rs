// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Client
//!
//! [`RabbitMQClient`] ties the pieces together: it owns the broker channel,
//! builds the payload codec when a secret is configured, and exposes
//! `publish`, `listen` and `close`. Applications pass the client around
//! explicitly; [`set_default_client`] and [`default_client`] keep a single
//! process-wide instance for code that cannot thread it through.

use crate::{
    broker::BrokerChannel,
    channel::new_amqp_channel,
    configs::BrokerConfig,
    crypto::MessageCodec,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    handler::ConsumerTable,
    publisher::{PublishRequest, Publisher, RabbitMQPublisher},
    recovery::RecoveryPolicy,
};
use opentelemetry::Context;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, info};

static DEFAULT_CLIENT: OnceLock<Arc<RabbitMQClient>> = OnceLock::new();

/// Topic publish/subscribe client over one broker channel.
pub struct RabbitMQClient {
    cfg: BrokerConfig,
    channel: Arc<dyn BrokerChannel>,
    codec: Option<Arc<MessageCodec>>,
    publisher: Arc<RabbitMQPublisher>,
    recovery: RecoveryPolicy,
    shutdown: watch::Sender<bool>,
}

impl RabbitMQClient {
    /// Connects to the broker described by `cfg` and opens the client channel.
    ///
    /// # Parameters
    /// * `cfg` - Broker configuration; validated before connecting
    ///
    /// # Returns
    /// The connected client, or the configuration, connection or channel error
    pub async fn connect(cfg: BrokerConfig) -> Result<RabbitMQClient, AmqpError> {
        cfg.validate()?;
        let channel = new_amqp_channel(&cfg).await?;
        RabbitMQClient::with_channel(cfg, channel)
    }

    /// Builds a client over an already opened channel.
    ///
    /// Fails when the configured secret is too short to enable encryption.
    pub fn with_channel(
        cfg: BrokerConfig,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<RabbitMQClient, AmqpError> {
        cfg.validate()?;

        let codec = match cfg.encryption_secret() {
            Some(secret) => Some(Arc::new(MessageCodec::new(secret)?)),
            None => None,
        };
        debug!(encryption = codec.is_some(), "creating rabbitmq client");

        let mut publisher = RabbitMQPublisher::new(channel.clone(), &cfg.exchange)
            .debug(cfg.debug)
            .on_exhausted(cfg.on_publish_exhausted);
        if let Some(codec) = &codec {
            publisher = publisher.codec(codec.clone());
        }

        Ok(RabbitMQClient {
            recovery: cfg.recovery_policy(),
            cfg,
            channel,
            codec,
            publisher: Arc::new(publisher),
            shutdown: watch::channel(false).0,
        })
    }

    /// Overrides the recovery policy derived from the configuration.
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    pub fn encryption_enabled(&self) -> bool {
        self.codec.is_some()
    }

    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    /// Publishes `req` to the configured exchange.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `req` - Topic and serialized message to send
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message; see
    /// [`RabbitMQPublisher::publish`] for retries
    pub async fn publish(&self, ctx: &Context, req: &PublishRequest) -> Result<(), AmqpError> {
        self.publisher.publish(ctx, req).await
    }

    /// Consumes the queues of `table` until the client is closed.
    ///
    /// See [`RabbitMQDispatcher::listen`].
    pub async fn listen(&self, table: ConsumerTable) -> Result<(), AmqpError> {
        let mut dispatcher = RabbitMQDispatcher::new(self.channel.clone(), &self.cfg.exchange)
            .app_name(&self.cfg.app_name)
            .ack_mode(self.cfg.ack_mode)
            .debug(self.cfg.debug)
            .recovery_policy(self.recovery)
            .shutdown(self.shutdown.subscribe());
        if let Some(codec) = &self.codec {
            dispatcher = dispatcher.codec(codec.clone());
        }

        dispatcher.listen(table).await
    }

    /// Closes the channel and the connection, and stops any running
    /// `listen`, including one waiting to recover. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shutdown.send_replace(true) {
            debug!("client already closed");
            return Ok(());
        }

        info!("closing rabbitmq client");
        self.channel.close().await
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Installs the process-wide default client. Fails if one is already set.
pub fn set_default_client(client: Arc<RabbitMQClient>) -> Result<(), AmqpError> {
    DEFAULT_CLIENT
        .set(client)
        .map_err(|_| AmqpError::ConfigError("default client already set".to_owned()))
}

/// The process-wide default client, if one was installed.
pub fn default_client() -> Option<Arc<RabbitMQClient>> {
    DEFAULT_CLIENT.get().cloned()
}
