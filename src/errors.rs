// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topic Pub/Sub Client
//!
//! This module provides the error taxonomy shared by the publisher, the
//! dispatcher and the recovery supervisor. The `AmqpError` enum covers
//! connection and topology setup, request validation, payload encoding,
//! transport publishing and consumer recovery.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Setup variants (`Declare*`, `Binding*`, `ConsumerDeclarationError`) are
/// fatal when raised by the initial `listen` call. Validation variants are
/// returned before any transport attempt. Transport variants are retried by
/// the publisher according to the request retry settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error opening a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The publish topic was empty or blank
    #[error("topic is required")]
    TopicRequired,

    /// The publish message was null
    #[error("message is required")]
    MessageRequired,

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error encrypting a message payload
    #[error("failure to encrypt payload `{0}`")]
    EncryptionError(String),

    /// Error decrypting a message payload
    #[error("failure to decrypt payload `{0}`")]
    DecryptionError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The overall publish deadline elapsed before an attempt succeeded
    #[error("publish deadline exceeded")]
    PublishDeadlineExceeded,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The recovery policy gave up restarting the consumers
    #[error("consumer recovery gave up after {0} attempts")]
    RecoveryExhausted(u32),
}
