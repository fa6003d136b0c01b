// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings, payload encryption secret and the delivery/recovery
//! policies of the client. Values can be built in code or loaded from
//! `RABBITMQ_*` environment variables.

use crate::{errors::AmqpError, publisher::ExhaustionPolicy, recovery::RecoveryPolicy};
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Minimum number of characters a payload encryption secret must have.
pub const MIN_SECRET_LEN: usize = 24;

/// Prefix of the environment variables read by [`BrokerConfig::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// How deliveries are acknowledged to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker considers a delivery acknowledged as soon as it is sent.
    #[default]
    Auto,
    /// Deliveries are acked after dispatch and rejected (without requeue)
    /// when they cannot be processed.
    Manual,
}

/// Configuration of a [`RabbitMQClient`](crate::client::RabbitMQClient).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub app_name: String,
    /// Name of the durable topic exchange every message goes through.
    pub exchange: String,
    /// Enables payload encryption when present.
    pub secret: Option<String>,
    /// Logs message bodies at debug level.
    pub debug: bool,
    pub ack_mode: AckMode,
    pub on_publish_exhausted: ExhaustionPolicy,
    pub recovery_cooldown_ms: u64,
    /// Absent means consumers are restarted forever.
    pub recovery_max_attempts: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            app_name: "rabbitmq-pubsub".to_owned(),
            exchange: "exchange".to_owned(),
            secret: None,
            debug: false,
            ack_mode: AckMode::Auto,
            on_publish_exhausted: ExhaustionPolicy::default(),
            recovery_cooldown_ms: 5000,
            recovery_max_attempts: None,
        }
    }
}

impl BrokerConfig {
    /// Loads the configuration from `RABBITMQ_*` environment variables,
    /// e.g. `RABBITMQ_HOST`, `RABBITMQ_SECRET` or `RABBITMQ_ACK_MODE=manual`.
    /// Missing variables keep their default value.
    pub fn from_env() -> Result<BrokerConfig, AmqpError> {
        let cfg = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|c| c.try_deserialize::<BrokerConfig>())
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the secret invariant: a blank secret counts as absent, any
    /// other secret must be at least [`MIN_SECRET_LEN`] characters long.
    pub fn validate(&self) -> Result<(), AmqpError> {
        match self.encryption_secret() {
            Some(secret) if secret.chars().count() < MIN_SECRET_LEN => {
                Err(AmqpError::ConfigError(format!(
                    "secret must be at least {} characters long",
                    MIN_SECRET_LEN
                )))
            }
            _ => Ok(()),
        }
    }

    /// The secret used for payload encryption, if encryption is enabled.
    pub fn encryption_secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_secret().is_some()
    }

    /// AMQP URI for this configuration.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Recovery policy described by `recovery_cooldown_ms` and
    /// `recovery_max_attempts`.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        let policy = RecoveryPolicy::fixed(Duration::from_millis(self.recovery_cooldown_ms));

        match self.recovery_max_attempts {
            Some(max) => policy.bounded(max),
            None => policy,
        }
    }
}
