// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module processes the deliveries of one queue. Each registered queue
//! gets one dispatch loop that reads its delivery stream in order, decrypts
//! the body when encryption is enabled and calls the handler registered for
//! the delivery routing key.
//!
//! Deliveries that cannot be processed (no handler, undecryptable body,
//! handler failure) are logged and dropped. A fatal handler error or a panic
//! ends the loop with a [`ConsumerFault`] so the dispatcher can recover.

use crate::{
    broker::{Acknowledger, Delivery, DeliveryStream},
    configs::AckMode,
    crypto::MessageCodec,
    handler::{ConsumerMessage, ConsumerTable, HandlerError},
    otel,
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};

/// State shared by every dispatch loop of one consumer generation.
pub(crate) struct DispatchContext {
    pub(crate) table: Arc<ConsumerTable>,
    pub(crate) codec: Option<Arc<MessageCodec>>,
    pub(crate) ack_mode: AckMode,
    pub(crate) debug: bool,
    /// Set once any delivery of this generation was handled successfully.
    pub(crate) progress: Arc<AtomicBool>,
}

/// A failure that ends a dispatch loop and triggers recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFault {
    pub queue: String,
    pub correlation_id: String,
    pub routing_key: String,
    pub reason: String,
}

/// Why a dispatch loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The delivery stream ended (consumer cancelled or channel closed).
    Closed { queue: String },
    Faulted(ConsumerFault),
}

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Handled,
    Dropped(&'static str),
}

/// Reads `stream` until it ends or a delivery faults.
pub(crate) async fn dispatch_loop(
    ctx: Arc<DispatchContext>,
    queue: String,
    mut stream: DeliveryStream,
) -> LoopExit {
    info!(queue = queue.as_str(), "queue started");

    while let Some(result) = stream.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(queue = queue.as_str(), error = err.to_string(), "errors consume msg");
                continue;
            }
        };

        let correlation_id = delivery.correlation_id.clone();
        let routing_key = delivery.routing_key.clone();

        match consume(&ctx, &queue, delivery).await {
            Ok(Outcome::Handled) => {
                ctx.progress.store(true, Ordering::SeqCst);
            }
            Ok(Outcome::Dropped(reason)) => {
                debug!(
                    queue = queue.as_str(),
                    correlation_id = correlation_id.as_str(),
                    routing_key = routing_key.as_str(),
                    reason,
                    "delivery dropped"
                );
            }
            Err(reason) => {
                return LoopExit::Faulted(ConsumerFault {
                    queue,
                    correlation_id,
                    routing_key,
                    reason,
                });
            }
        }
    }

    info!(queue = queue.as_str(), "queue stopped");
    LoopExit::Closed { queue }
}

/// Processes one delivery of `queue`.
///
/// Returns `Err` with the fault reason when the handler reports a fatal
/// error or panics.
pub(crate) async fn consume(
    ctx: &DispatchContext,
    queue: &str,
    delivery: Delivery,
) -> Result<Outcome, String> {
    let Delivery {
        routing_key,
        correlation_id,
        headers,
        body,
        acker,
        ..
    } = delivery;

    info!(
        correlation_id = correlation_id.as_str(),
        routing_key = routing_key.as_str(),
        "consuming topic..."
    );

    let Some(handler) = ctx.table.handler(queue, &routing_key) else {
        error!(
            correlation_id = correlation_id.as_str(),
            routing_key = routing_key.as_str(),
            "consumer not found"
        );
        settle(acker.as_deref(), Settle::Ack).await;
        return Ok(Outcome::Dropped("unsupported topic"));
    };

    let data = match &ctx.codec {
        Some(codec) => match codec.decrypt(&body) {
            Ok(plain) => plain,
            Err(err) => {
                error!(
                    correlation_id = correlation_id.as_str(),
                    routing_key = routing_key.as_str(),
                    error = err.to_string(),
                    "error decrypting message"
                );
                settle(acker.as_deref(), Settle::Reject).await;
                return Ok(Outcome::Dropped("undecryptable body"));
            }
        },
        None => body,
    };

    if ctx.debug {
        debug!(
            correlation_id = correlation_id.as_str(),
            body = String::from_utf8_lossy(&data).as_ref(),
            "message body"
        );
    }

    let tracer = global::tracer("amqp consumer");
    let (otel_ctx, mut span) = otel::new_span(&headers, &tracer, &routing_key);

    let msg = ConsumerMessage {
        queue: queue.to_owned(),
        topic: routing_key.clone(),
        correlation_id: correlation_id.clone(),
        data,
        headers,
    };

    let result = AssertUnwindSafe(handler.exec(&otel_ctx, &msg))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            settle(acker.as_deref(), Settle::Ack).await;
            Ok(Outcome::Handled)
        }
        Ok(Err(HandlerError::Failed(reason))) => {
            error!(
                correlation_id = correlation_id.as_str(),
                routing_key = routing_key.as_str(),
                error = reason.as_str(),
                "error consuming message"
            );
            span.record_error(&HandlerError::Failed(reason.clone()));
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });
            settle(acker.as_deref(), Settle::Reject).await;
            Ok(Outcome::Dropped("handler failure"))
        }
        Ok(Err(HandlerError::Fatal(reason))) => {
            span.record_error(&HandlerError::Fatal(reason.clone()));
            span.set_status(Status::Error {
                description: Cow::from(reason.clone()),
            });
            settle(acker.as_deref(), Settle::Reject).await;
            Err(reason)
        }
        Err(panic) => {
            let reason = panic_reason(panic);
            span.set_status(Status::Error {
                description: Cow::from(reason.clone()),
            });
            settle(acker.as_deref(), Settle::Reject).await;
            Err(format!("handler panicked: {}", reason))
        }
    }
}

enum Settle {
    Ack,
    Reject,
}

/// Acks or rejects (without requeue) a manually acknowledged delivery.
/// Settlement failures are logged only; the broker redelivers unsettled
/// messages once the channel closes.
async fn settle(acker: Option<&dyn Acknowledger>, how: Settle) {
    let Some(acker) = acker else {
        return;
    };

    let result = match how {
        Settle::Ack => acker.ack().await,
        Settle::Reject => acker.reject(false).await,
    };

    if let Err(err) = result {
        warn!(error = err.to_string(), "failure to settle delivery");
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

impl DispatchContext {
    pub(crate) fn no_ack(&self) -> bool {
        self.ack_mode == AckMode::Auto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::AmqpError, handler::ConsumerHandler};
    use async_trait::async_trait;
    use futures_util::stream;
    use opentelemetry::Context;
    use std::sync::Mutex;

    const SECRET: &str = "a-shared-secret-of-24-chars!";

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ConsumerMessage>>,
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(msg.clone());
            match msg.data.as_slice() {
                b"\"fail\"" => Err(HandlerError::failed("bad order")),
                b"\"fatal\"" => Err(HandlerError::fatal("lost state")),
                b"\"panic\"" => panic!("handler bug"),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
            assert!(!requeue);
            self.calls.lock().unwrap().push("reject");
            Ok(())
        }
    }

    fn context(handler: Arc<Recorder>, codec: Option<Arc<MessageCodec>>) -> DispatchContext {
        DispatchContext {
            table: Arc::new(ConsumerTable::new().register("orders", "order.created", handler)),
            codec,
            ack_mode: AckMode::Manual,
            debug: true,
            progress: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_missing_handler_drops_and_acks() {
        let handler = Arc::new(Recorder::default());
        let ctx = context(handler.clone(), None);
        let acker = Arc::new(RecordingAcker::default());

        let delivery =
            Delivery::new("order.deleted", "c-1", b"{}".to_vec()).with_acker(acker.clone());
        let outcome = consume(&ctx, "orders", delivery).await;

        assert_eq!(outcome, Ok(Outcome::Dropped("unsupported topic")));
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_decrypts_before_dispatch() {
        let handler = Arc::new(Recorder::default());
        let codec = Arc::new(MessageCodec::new(SECRET).unwrap());
        let ctx = context(handler.clone(), Some(codec.clone()));

        let body = codec.encrypt(&serde_json::json!({"id": 9})).unwrap();
        let delivery = Delivery::new("order.created", "c-1", body);
        let outcome = consume(&ctx, "orders", delivery).await;

        assert_eq!(outcome, Ok(Outcome::Handled));
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0].data, br#"{"id":9}"#.to_vec());
        assert_eq!(seen[0].correlation_id, "c-1");
        assert_eq!(seen[0].queue, "orders");
    }

    #[tokio::test]
    async fn test_undecryptable_body_is_dropped() {
        let handler = Arc::new(Recorder::default());
        let codec = Arc::new(MessageCodec::new(SECRET).unwrap());
        let ctx = context(handler.clone(), Some(codec));
        let acker = Arc::new(RecordingAcker::default());

        let delivery =
            Delivery::new("order.created", "c-1", b"{\"id\":9}".to_vec()).with_acker(acker.clone());
        let outcome = consume(&ctx, "orders", delivery).await;

        assert_eq!(outcome, Ok(Outcome::Dropped("undecryptable body")));
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained() {
        let handler = Arc::new(Recorder::default());
        let ctx = context(handler, None);
        let acker = Arc::new(RecordingAcker::default());

        let delivery =
            Delivery::new("order.created", "c-1", b"\"fail\"".to_vec()).with_acker(acker.clone());
        let outcome = consume(&ctx, "orders", delivery).await;

        assert_eq!(outcome, Ok(Outcome::Dropped("handler failure")));
        assert_eq!(*acker.calls.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test]
    async fn test_fatal_and_panic_are_faults() {
        let handler = Arc::new(Recorder::default());
        let ctx = context(handler, None);

        let fatal = Delivery::new("order.created", "c-1", b"\"fatal\"".to_vec());
        assert_eq!(
            consume(&ctx, "orders", fatal).await,
            Err("lost state".to_owned())
        );

        let panicked = Delivery::new("order.created", "c-2", b"\"panic\"".to_vec());
        assert_eq!(
            consume(&ctx, "orders", panicked).await,
            Err("handler panicked: handler bug".to_owned())
        );
    }

    #[tokio::test]
    async fn test_loop_keeps_order_and_stops_on_fault() {
        let handler = Arc::new(Recorder::default());
        let ctx = Arc::new(context(handler.clone(), None));

        let deliveries = vec![
            Ok(Delivery::new("order.created", "c-1", b"1".to_vec())),
            Err(AmqpError::ConsumerError("frame error".to_owned())),
            Ok(Delivery::new("order.unknown", "c-2", b"2".to_vec())),
            Ok(Delivery::new("order.created", "c-3", b"\"fail\"".to_vec())),
            Ok(Delivery::new("order.created", "c-4", b"3".to_vec())),
            Ok(Delivery::new("order.created", "c-5", b"\"fatal\"".to_vec())),
            Ok(Delivery::new("order.created", "c-6", b"4".to_vec())),
        ];

        let stream = stream::iter(deliveries).boxed();
        let exit = dispatch_loop(ctx.clone(), "orders".to_owned(), stream).await;

        assert_eq!(
            exit,
            LoopExit::Faulted(ConsumerFault {
                queue: "orders".to_owned(),
                correlation_id: "c-5".to_owned(),
                routing_key: "order.created".to_owned(),
                reason: "lost state".to_owned(),
            })
        );

        let ids: Vec<String> = handler
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.correlation_id.clone())
            .collect();
        assert_eq!(ids, vec!["c-1", "c-3", "c-4", "c-5"]);
        assert!(ctx.progress.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_loop_ends_with_stream() {
        let handler = Arc::new(Recorder::default());
        let ctx = Arc::new(context(handler, None));

        let exit = dispatch_loop(ctx.clone(), "orders".to_owned(), stream::empty().boxed()).await;

        assert_eq!(exit, LoopExit::Closed { queue: "orders".to_owned() });
        assert!(!ctx.progress.load(Ordering::SeqCst));
    }
}
