// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use opentelemetry::Context;
use rabbitmq_pubsub::{
    broker::{Acknowledger, BrokerChannel, Delivery, DeliveryStream, OutboundMessage},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, ConsumerMessage, HandlerError},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

type DeliverySender = UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Default)]
struct QueueState {
    bindings: HashSet<(String, String)>,
    backlog: VecDeque<Delivery>,
    consumers: Vec<(String, DeliverySender)>,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    declared: HashMap<String, usize>,
    bound: HashMap<String, usize>,
    consumed: HashMap<String, usize>,
    published: Vec<OutboundMessage>,
    settled: Vec<(String, &'static str)>,
    fail_queue_declare: bool,
}

/// Topic exchange broker kept in memory. Deliveries published while a queue
/// has no consumer wait in the queue backlog.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    pub fn declared(&self, queue: &str) -> usize {
        self.state.lock().unwrap().declared.get(queue).copied().unwrap_or(0)
    }

    pub fn bound(&self, queue: &str) -> usize {
        self.state.lock().unwrap().bound.get(queue).copied().unwrap_or(0)
    }

    pub fn consumed(&self, queue: &str) -> usize {
        self.state.lock().unwrap().consumed.get(queue).copied().unwrap_or(0)
    }

    pub fn active_consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn settled(&self) -> Vec<(String, &'static str)> {
        self.state.lock().unwrap().settled.clone()
    }

    pub fn fail_queue_declare(&self, fail: bool) {
        self.state.lock().unwrap().fail_queue_declare = fail;
    }
}

struct RecordingAcker {
    correlation_id: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .settled
            .push((self.correlation_id.clone(), "ack"));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let how = if requeue { "requeue" } else { "reject" };
        self.state
            .lock()
            .unwrap()
            .settled
            .push((self.correlation_id.clone(), how));
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(def.name().to_owned());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_queue_declare {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        *state.declared.entry(def.name().to_owned()).or_default() += 1;
        state.queues.entry(def.name().to_owned()).or_default();
        Ok(())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        *state.bound.entry(binding.queue_name().to_owned()).or_default() += 1;

        let queue = state
            .queues
            .get_mut(binding.queue_name())
            .ok_or_else(|| AmqpError::DeclareQueueError(binding.queue_name().to_owned()))?;
        queue.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.published.push(msg.clone());

        for queue in state.queues.values_mut() {
            let routed = queue.bindings.iter().any(|(exchange, key)| {
                exchange == &msg.exchange && topic_matches(key, &msg.routing_key)
            });
            if !routed {
                continue;
            }

            let mut delivery =
                Delivery::new(&msg.routing_key, &msg.correlation_id, msg.body.clone());
            delivery.exchange = msg.exchange.clone();
            delivery.headers = msg.headers.clone();
            queue.backlog.push_back(delivery);
            queue.flush();
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().unwrap();
        *state.consumed.entry(queue.to_owned()).or_default() += 1;

        let (tx, rx) = unbounded_channel();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;
        queue_state
            .consumers
            .push((consumer_tag.to_owned(), tx));
        queue_state.flush();

        let shared = self.state.clone();
        Ok(receiver_stream(rx)
            .map(move |item| {
                item.map(|delivery| {
                    if no_ack {
                        return delivery;
                    }
                    let acker = Arc::new(RecordingAcker {
                        correlation_id: delivery.correlation_id.clone(),
                        state: shared.clone(),
                    });
                    delivery.with_acker(acker)
                })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|(tag, _)| tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }
}

impl QueueState {
    /// Hands the backlog to the first consumer still listening.
    fn flush(&mut self) {
        while let Some(delivery) = self.backlog.pop_front() {
            loop {
                let Some((_, tx)) = self.consumers.first() else {
                    self.backlog.push_front(delivery);
                    return;
                };
                if tx.send(Ok(delivery.clone())).is_ok() {
                    break;
                }
                self.consumers.remove(0);
            }
        }
    }
}

fn receiver_stream(
    rx: UnboundedReceiver<Result<Delivery, AmqpError>>,
) -> impl futures_util::Stream<Item = Result<Delivery, AmqpError>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// What a [`ChannelHandler`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub queue: String,
    pub topic: String,
    pub correlation_id: String,
    pub data: Vec<u8>,
}

/// Forwards every message to a channel. Bodies `"boom"` and `"panic"` make
/// the handler fail fatally or panic; `"fail"` is an ordinary failure.
pub struct ChannelHandler {
    tx: UnboundedSender<Received>,
}

impl ChannelHandler {
    pub fn pair() -> (Arc<ChannelHandler>, UnboundedReceiver<Received>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(ChannelHandler { tx }), rx)
    }
}

#[async_trait]
impl ConsumerHandler for ChannelHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let _ = self.tx.send(Received {
            queue: msg.queue.clone(),
            topic: msg.topic.clone(),
            correlation_id: msg.correlation_id.clone(),
            data: msg.data.clone(),
        });

        match msg.data.as_slice() {
            b"\"boom\"" => Err(HandlerError::fatal("boom")),
            b"\"panic\"" => panic!("handler bug"),
            b"\"fail\"" => Err(HandlerError::failed("rejected")),
            _ => Ok(()),
        }
    }
}

/// Polls `cond` on the (possibly paused) tokio clock.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub async fn recv(rx: &mut UnboundedReceiver<Received>) -> Received {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no message received in time")
        .expect("handler channel closed")
}

/// Lets every ready task run without moving the clock far.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}
