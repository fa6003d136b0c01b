// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of the AMQP connection and
//! its single channel. [`AmqpChannel`] owns both for the lifetime of the client
//! and implements [`BrokerChannel`] on top of `lapin`. `lapin` channels are safe
//! for concurrent use, so declare, bind, publish and consume calls are not
//! serialized here.

use crate::{
    broker::{Acknowledger, BrokerChannel, Delivery, DeliveryStream, OutboundMessage},
    configs::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error, info};

/// Reply code sent to the broker on a graceful close.
const REPLY_SUCCESS: u16 = 200;

/// A `lapin` connection and the one channel opened on it.
pub struct AmqpChannel {
    conn: Connection,
    channel: Channel,
}

/// Connects to RabbitMQ and opens the channel used by the client.
///
/// The connection is named after `cfg.app_name` so it can be identified in
/// the broker management UI.
pub async fn new_amqp_channel(cfg: &BrokerConfig) -> Result<Arc<AmqpChannel>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok(Arc::new(AmqpChannel { conn, channel }))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_message_id(ShortString::from(msg.correlation_id.clone()))
            .with_correlation_id(ShortString::from(msg.correlation_id.clone()))
            .with_headers(to_field_table(&msg.headers));

        if let Some(user_id) = &msg.user_id {
            props = props.with_user_id(ShortString::from(user_id.clone()));
        }
        if let Some(app_id) = &msg.app_id {
            props = props.with_app_id(ShortString::from(app_id.clone()));
        }

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(from_lapin(delivery, no_ack)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut result = Ok(());

        match self.channel.close(REPLY_SUCCESS, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "error closing channel");
                result = Err(AmqpError::CloseError("channel".to_owned()));
            }
            _ => info!("channel closed successfully"),
        }

        match self.conn.close(REPLY_SUCCESS, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "error closing connection");
                result = result.and(Err(AmqpError::CloseError("connection".to_owned())));
            }
            _ => info!("connection closed successfully"),
        }

        result
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn from_lapin(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let props = &delivery.properties;

    let correlation_id = props
        .correlation_id()
        .as_ref()
        .or(props.message_id().as_ref())
        .map(|id| id.to_string())
        .unwrap_or_default();

    let headers = props
        .headers()
        .as_ref()
        .map(|table| from_field_table(table.inner()))
        .unwrap_or_default();

    let acker: Option<Arc<dyn Acknowledger>> = if no_ack {
        None
    } else {
        Some(Arc::new(LapinAcker(delivery.acker.clone())))
    };

    Delivery {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        correlation_id,
        headers,
        body: delivery.data,
        acker,
    }
}

fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

fn from_field_table(table: &BTreeMap<ShortString, AMQPValue>) -> HashMap<String, String> {
    table
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}
