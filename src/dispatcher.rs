// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module installs the consumer topology and supervises the dispatch
//! loops. `listen` declares the durable topic exchange, then for every queue
//! of the consumer table declares a durable queue, binds it to each of its
//! topics and starts one dispatch loop. Loops of different queues run
//! concurrently; deliveries of one queue are processed in order.
//!
//! When any loop faults, the whole generation of loops is torn down and,
//! after the cooldown chosen by the [`RecoveryPolicy`], every queue is
//! declared, bound and consumed again.

use crate::{
    broker::BrokerChannel,
    configs::AckMode,
    consumer::{dispatch_loop, ConsumerFault, DispatchContext, LoopExit},
    crypto::MessageCodec,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerTable,
    queue::{QueueBinding, QueueDefinition},
    recovery::{RecoveryPolicy, RecoveryState},
    topology::{AmqpTopology, Topology},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Consumes the queues of a [`ConsumerTable`] from one topic exchange.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn BrokerChannel>,
    codec: Option<Arc<MessageCodec>>,
    exchange: String,
    app_name: String,
    ack_mode: AckMode,
    debug: bool,
    recovery: RecoveryPolicy,
    shutdown: watch::Receiver<bool>,
}

/// The dispatch loops started by one installation of the consumer table.
struct Generation {
    loops: JoinSet<LoopExit>,
    consumer_tags: Vec<String>,
    progress: Arc<AtomicBool>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher consuming from `exchange` over `channel`.
    ///
    /// # Parameters
    /// * `channel` - Broker channel shared with the publisher
    /// * `exchange` - Name of the topic exchange every queue is bound to
    ///
    /// # Returns
    /// A dispatcher with auto-ack, no encryption and the default recovery
    /// policy
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: &str) -> RabbitMQDispatcher {
        let (_, shutdown) = watch::channel(false);

        RabbitMQDispatcher {
            channel,
            codec: None,
            exchange: exchange.to_owned(),
            app_name: "rabbitmq-pubsub".to_owned(),
            ack_mode: AckMode::default(),
            debug: false,
            recovery: RecoveryPolicy::default(),
            shutdown,
        }
    }

    /// Decrypts every delivery body with `codec` before dispatch.
    pub fn codec(mut self, codec: Arc<MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Prefix of the consumer tags.
    pub fn app_name(mut self, app_name: &str) -> Self {
        self.app_name = app_name.to_owned();
        self
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    /// Stops recovery once `shutdown` turns `true`.
    pub fn shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Installs the topology for `table` and consumes until every delivery
    /// stream ends or the dispatcher is shut down.
    ///
    /// # Parameters
    /// * `table` - Handlers by queue and topic; owned by the dispatcher from
    ///   now on
    ///
    /// # Returns
    /// `Ok(())` once all consumers are closed or shutdown is signaled, even in
    /// the middle of a recovery cooldown. Fails immediately when the initial
    /// topology cannot be installed, and with `AmqpError::RecoveryExhausted`
    /// when the recovery policy gives up.
    pub async fn listen(&self, table: ConsumerTable) -> Result<(), AmqpError> {
        let table = Arc::new(table);

        AmqpTopology::new(self.channel.clone())
            .exchange(ExchangeDefinition::new(&self.exchange).durable())
            .install()
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error declaring exchange"))?;

        let mut generation = self
            .start(&table)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error starting consumers"))?;
        let mut faults = 0;

        loop {
            let Some(fault) = self.supervise(&mut generation).await else {
                info!("all consumers closed");
                return Ok(());
            };

            error!(
                queue = fault.queue.as_str(),
                correlation_id = fault.correlation_id.as_str(),
                routing_key = fault.routing_key.as_str(),
                reason = fault.reason.as_str(),
                "consumer fault"
            );

            if generation.progress.load(Ordering::SeqCst) {
                faults = 0;
            }
            self.stop(&mut generation).await;

            match self.recover(&table, &mut faults).await? {
                Some(restarted) => generation = restarted,
                None => {
                    info!("dispatcher shut down during recovery");
                    return Ok(());
                }
            }
        }
    }

    /// Waits for the restart cooldown and installs the whole table again,
    /// counting failed installations as further faults. Returns `None` when
    /// shutdown is signaled before a new generation is running.
    async fn recover(
        &self,
        table: &Arc<ConsumerTable>,
        faults: &mut u32,
    ) -> Result<Option<Generation>, AmqpError> {
        loop {
            if self.is_shut_down() {
                return Ok(None);
            }
            *faults += 1;

            match self.recovery.next(*faults) {
                RecoveryState::GivingUp { attempts } => {
                    error!(attempts, "giving up consumer recovery");
                    return Err(AmqpError::RecoveryExhausted(attempts));
                }
                RecoveryState::Retrying { attempt, delay } => {
                    info!(attempt, ?delay, "rejoin rabbitmq...");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shut_down() => return Ok(None),
                    }
                }
            }

            match self.start(table).await {
                Ok(mut generation) if self.is_shut_down() => {
                    self.stop(&mut generation).await;
                    return Ok(None);
                }
                Ok(generation) => return Ok(Some(generation)),
                Err(err) => error!(error = err.to_string(), "error restarting consumers"),
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown is signaled; never resolves when nobody can
    /// signal it anymore.
    async fn shut_down(&self) {
        let mut shutdown = self.shutdown.clone();
        if shutdown.wait_for(|closed| *closed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Declares and binds every queue of `table` and spawns its dispatch loop.
    async fn start(&self, table: &Arc<ConsumerTable>) -> Result<Generation, AmqpError> {
        let ctx = Arc::new(DispatchContext {
            table: table.clone(),
            codec: self.codec.clone(),
            ack_mode: self.ack_mode,
            debug: self.debug,
            progress: Arc::new(AtomicBool::new(false)),
        });

        let mut generation = Generation {
            loops: JoinSet::new(),
            consumer_tags: vec![],
            progress: ctx.progress.clone(),
        };

        for queue in table.queues() {
            let topology = table.topics(queue).fold(
                AmqpTopology::new(self.channel.clone())
                    .queue(QueueDefinition::new(queue).durable()),
                |topology, topic| {
                    topology.queue_binding(
                        QueueBinding::new(queue)
                            .exchange(&self.exchange)
                            .routing_key(topic),
                    )
                },
            );

            let started = async {
                topology.install().await?;

                let tag = format!("{}-{}-{}", self.app_name, queue, Uuid::new_v4());
                let stream = self.channel.consume(queue, &tag, ctx.no_ack()).await?;
                Ok::<_, AmqpError>((tag, stream))
            }
            .await;

            match started {
                Ok((tag, stream)) => {
                    generation.consumer_tags.push(tag);
                    generation
                        .loops
                        .spawn(dispatch_loop(ctx.clone(), queue.clone(), stream));
                }
                Err(err) => {
                    self.stop(&mut generation).await;
                    return Err(err);
                }
            }
        }

        Ok(generation)
    }

    /// Waits until a loop faults, or returns `None` when every loop closed.
    async fn supervise(&self, generation: &mut Generation) -> Option<ConsumerFault> {
        while let Some(joined) = generation.loops.join_next().await {
            match joined {
                Ok(LoopExit::Closed { queue }) => {
                    info!(queue = queue.as_str(), "consumer closed");
                }
                Ok(LoopExit::Faulted(fault)) => return Some(fault),
                Err(err) if err.is_panic() => {
                    return Some(ConsumerFault {
                        queue: String::new(),
                        correlation_id: String::new(),
                        routing_key: String::new(),
                        reason: format!("dispatch loop panicked: {}", err),
                    });
                }
                Err(err) => warn!(error = err.to_string(), "dispatch loop cancelled"),
            }
        }

        None
    }

    /// Aborts every loop of `generation` and cancels their consumers.
    async fn stop(&self, generation: &mut Generation) {
        generation.loops.shutdown().await;

        for tag in generation.consumer_tags.drain(..) {
            if let Err(err) = self.channel.cancel(&tag).await {
                warn!(
                    consumer_tag = tag.as_str(),
                    error = err.to_string(),
                    "failure to cancel consumer"
                );
            }
        }
    }
}
