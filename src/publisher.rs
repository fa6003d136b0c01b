// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes messages to the topic exchange. A publish call
//! validates the request, serializes (and optionally encrypts) the message and
//! retries failed attempts with a fixed delay. All attempts of one call share
//! a correlation id, and the whole call is bounded by a deadline.

use crate::{
    broker::{BrokerChannel, OutboundMessage},
    crypto::{self, MessageCodec},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Content type of plain JSON bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of encrypted (base64) bodies
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// Upper bound on the duration of one publish call, retries included.
pub const PUBLISH_DEADLINE: Duration = Duration::from_secs(10);
/// Delay between attempts when the request does not set one.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// What a publish call returns once every attempt failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Return the error of the last attempt.
    #[default]
    PropagateLastError,
    /// Log the failure and report success to the caller.
    SwallowOnExhaustion,
}

/// A message to publish and how hard to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    /// The message serialized to JSON, field order preserved.
    pub message: Vec<u8>,
    /// Generated per call when absent.
    pub correlation_id: Option<String>,
    /// Number of attempts; values below 1 mean a single attempt.
    pub retries: u32,
    pub retry_delay: Option<Duration>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl PublishRequest {
    /// Creates a request publishing `message` under the `topic` routing key.
    ///
    /// The message is serialized once, here, so every attempt sends the same
    /// bytes.
    ///
    /// # Parameters
    /// * `topic` - Routing key the message is published with
    /// * `message` - Any serializable value
    ///
    /// # Returns
    /// A request with a single attempt, or `AmqpError::ParsePayloadError` when
    /// the message cannot be serialized
    pub fn new<T>(topic: &str, message: &T) -> Result<PublishRequest, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let message = crypto::to_bytes(message)?;

        Ok(PublishRequest {
            topic: topic.to_owned(),
            message,
            correlation_id: None,
            retries: 1,
            retry_delay: None,
            user_id: None,
            app_id: None,
        })
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    /// Fails fast on a blank topic or a null message.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.topic.trim().is_empty() {
            return Err(AmqpError::TopicRequired);
        }

        if self.message.is_empty() || self.message == b"null" {
            return Err(AmqpError::MessageRequired);
        }

        Ok(())
    }

    fn attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

/// Publishes messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, req: &PublishRequest) -> Result<(), AmqpError>;
}

/// Publisher sending every message to one topic exchange.
pub struct RabbitMQPublisher {
    channel: Arc<dyn BrokerChannel>,
    codec: Option<Arc<MessageCodec>>,
    exchange: String,
    debug: bool,
    on_exhausted: ExhaustionPolicy,
    deadline: Duration,
}

impl RabbitMQPublisher {
    /// Creates a publisher sending to `exchange` over `channel`.
    ///
    /// # Parameters
    /// * `channel` - Broker channel to publish on
    /// * `exchange` - Name of the topic exchange messages are published to
    ///
    /// # Returns
    /// A publisher without encryption that propagates the last error once a
    /// request runs out of attempts
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: &str) -> RabbitMQPublisher {
        RabbitMQPublisher {
            channel,
            codec: None,
            exchange: exchange.to_owned(),
            debug: false,
            on_exhausted: ExhaustionPolicy::default(),
            deadline: PUBLISH_DEADLINE,
        }
    }

    /// Encrypts every message body with `codec`.
    pub fn codec(mut self, codec: Arc<MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Logs message bodies at debug level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn on_exhausted(mut self, policy: ExhaustionPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes `req.message` under the `req.topic` routing key.
    ///
    /// Validation errors are returned before any attempt. Failed attempts
    /// are retried up to `req.retries` times, sleeping `req.retry_delay`
    /// between them. Once attempts or the deadline are exhausted, the
    /// configured [`ExhaustionPolicy`] decides what the caller sees.
    async fn publish(&self, ctx: &Context, req: &PublishRequest) -> Result<(), AmqpError> {
        req.validate()?;

        let correlation_id = req
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let attempts = req.attempts();

        info!(
            correlation_id = correlation_id.as_str(),
            topic = req.topic.as_str(),
            "publishing message..."
        );

        let outcome = match tokio::time::timeout(
            self.deadline,
            self.publish_with_retries(ctx, req, &correlation_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AmqpError::PublishDeadlineExceeded),
        };

        match outcome {
            Ok(attempt) => {
                info!(
                    correlation_id = correlation_id.as_str(),
                    attempt,
                    topic = req.topic.as_str(),
                    "message published successfully"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    correlation_id = correlation_id.as_str(),
                    attempts,
                    topic = req.topic.as_str(),
                    error = err.to_string(),
                    "error publishing message, attempts exhausted"
                );

                match self.on_exhausted {
                    ExhaustionPolicy::PropagateLastError => Err(err),
                    ExhaustionPolicy::SwallowOnExhaustion => Ok(()),
                }
            }
        }
    }
}

impl RabbitMQPublisher {
    /// Runs the attempts one after another, returning the index of the
    /// successful attempt or the error of the last one.
    async fn publish_with_retries(
        &self,
        ctx: &Context,
        req: &PublishRequest,
        correlation_id: &str,
    ) -> Result<u32, AmqpError> {
        let attempts = req.attempts();
        let delay = req.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);
        let mut attempt = 0;

        loop {
            info!(
                correlation_id,
                attempt,
                topic = req.topic.as_str(),
                "publishing topic"
            );

            match self.try_publish(ctx, req, correlation_id).await {
                Ok(()) => return Ok(attempt),
                Err(err) => {
                    error!(
                        correlation_id,
                        attempt,
                        topic = req.topic.as_str(),
                        error = err.to_string(),
                        "publish attempt failed"
                    );

                    attempt += 1;
                    if attempt >= attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_publish(
        &self,
        ctx: &Context,
        req: &PublishRequest,
        correlation_id: &str,
    ) -> Result<(), AmqpError> {
        if self.debug {
            debug!(
                correlation_id,
                message = String::from_utf8_lossy(&req.message).as_ref(),
                "message body"
            );
        }

        let (body, content_type) = match &self.codec {
            Some(codec) => (codec.seal(&req.message)?, TEXT_CONTENT_TYPE),
            None => (req.message.clone(), JSON_CONTENT_TYPE),
        };

        let msg = OutboundMessage {
            exchange: self.exchange.clone(),
            routing_key: req.topic.clone(),
            body,
            correlation_id: correlation_id.to_owned(),
            content_type: content_type.to_owned(),
            user_id: req.user_id.clone(),
            app_id: req.app_id.clone(),
            headers: otel::inject_context(ctx),
        };

        self.channel.publish(&msg).await
    }
}
