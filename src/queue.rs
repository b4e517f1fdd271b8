// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue Contracts
//!
//! The broker-neutral verb set implemented by every adapter, the callback
//! contracts invoked by dispatch loops, and the capability table each adapter
//! reports so callers know which verbs have a real effect.

use crate::{envelope::MessageEnvelope, errors::MessagingError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::debug;

/// Which verbs have a real effect on a given broker.
///
/// Verbs reported as `false` still succeed when called, they just do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub send: bool,
    pub peek: bool,
    pub receive: bool,
    pub listen: bool,
    pub complete: bool,
    pub abandon: bool,
    pub renew_lock: bool,
    pub move_to_dead_letter: bool,
    pub clear: bool,
}

impl Capabilities {
    pub const RABBITMQ: Capabilities = Capabilities {
        send: true,
        peek: true,
        receive: true,
        listen: true,
        complete: true,
        abandon: true,
        renew_lock: false,
        move_to_dead_letter: false,
        clear: true,
    };

    pub const KAFKA: Capabilities = Capabilities {
        send: true,
        peek: false,
        receive: true,
        listen: true,
        complete: true,
        abandon: false,
        renew_lock: false,
        move_to_dead_letter: false,
        clear: false,
    };

    /// Push-only brokers: MQTT and NATS.
    pub const PUSH_ONLY: Capabilities = Capabilities {
        send: true,
        peek: false,
        receive: false,
        listen: true,
        complete: false,
        abandon: false,
        renew_lock: false,
        move_to_dead_letter: false,
        clear: false,
    };

    pub const MEMORY: Capabilities = Capabilities {
        send: true,
        peek: true,
        receive: true,
        listen: true,
        complete: true,
        abandon: true,
        renew_lock: false,
        move_to_dead_letter: false,
        clear: true,
    };
}

/// Application callback invoked for every message a listening queue receives.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Handles one message. The receiver may `complete` or `abandon` the envelope
    /// through `queue`; whatever it leaves unresolved is acknowledged by the
    /// dispatch loop on brokers that need explicit acknowledgment.
    async fn receive_message(
        &self,
        ctx: &Context,
        envelope: &mut MessageEnvelope,
        queue: &dyn MessageQueue,
    ) -> Result<(), MessagingError>;
}

/// Connection-level callback a dispatch loop invokes for every native message
/// of a subscription.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(
        &self,
        ctx: &Context,
        topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError>;
}

/// Administrative operations over the queues (or topics) of a broker.
#[async_trait]
pub trait MessageQueueConnection: Send + Sync {
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError>;
    async fn create_queue(&self, name: &str) -> Result<(), MessagingError>;
    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError>;
}

/// The verb set shared by every broker adapter.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn open(&self) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;

    fn is_open(&self) -> bool;

    /// Publishes the envelope, stamping its `sent_time`.
    async fn send(&self, ctx: &Context, envelope: &mut MessageEnvelope)
        -> Result<(), MessagingError>;

    /// Returns the next message without removing it, if the broker allows it.
    async fn peek(&self) -> Result<Option<MessageEnvelope>, MessagingError>;

    async fn peek_batch(&self, max: usize) -> Result<Vec<MessageEnvelope>, MessagingError>;

    /// Waits up to `wait` for the next message. `Ok(None)` when nothing arrived.
    async fn receive(&self, wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError>;

    /// Starts delivering messages to `receiver` and returns once the dispatch
    /// loop is running.
    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError>;

    async fn end_listen(&self) -> Result<(), MessagingError>;

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), MessagingError>;

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), MessagingError>;

    async fn renew_lock(
        &self,
        envelope: &mut MessageEnvelope,
        lock_timeout: Duration,
    ) -> Result<(), MessagingError>;

    async fn move_to_dead_letter(&self, envelope: &mut MessageEnvelope)
        -> Result<(), MessagingError>;

    /// Removes every pending message.
    async fn clear(&self) -> Result<(), MessagingError>;
}

/// Bridges a connection subscription to an application [`MessageReceiver`].
///
/// Holds only a weak link to the connection; the queue handed to the receiver is
/// rebuilt around it for every message, so nothing registered inside the
/// connection keeps the connection alive.
pub(crate) struct QueueListener<C> {
    connection: Weak<C>,
    receiver: Arc<dyn MessageReceiver>,
    rebuild: Box<dyn Fn(Arc<C>) -> Box<dyn MessageQueue> + Send + Sync>,
}

impl<C: Send + Sync + 'static> QueueListener<C> {
    pub fn new(
        connection: &Arc<C>,
        receiver: Arc<dyn MessageReceiver>,
        rebuild: impl Fn(Arc<C>) -> Box<dyn MessageQueue> + Send + Sync + 'static,
    ) -> Arc<dyn MessageListener> {
        Arc::new(QueueListener {
            connection: Arc::downgrade(connection),
            receiver,
            rebuild: Box::new(rebuild),
        })
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> MessageListener for QueueListener<C> {
    async fn on_message(
        &self,
        ctx: &Context,
        _topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let Some(connection) = self.connection.upgrade() else {
            return Err(MessagingError::InvalidState(
                "connection was dropped".to_owned(),
            ));
        };
        let queue = (self.rebuild)(connection);
        self.receiver
            .receive_message(ctx, envelope, queue.as_ref())
            .await
    }
}

/// Logs a call to a verb the broker cannot honour.
pub(crate) fn unsupported(queue: &str, verb: &str) {
    debug!(queue = queue, verb = verb, "operation not supported, ignoring");
}

/// Resolves the envelope reference as completed. A missing reference is a no-op.
pub(crate) async fn complete_reference(
    envelope: &mut MessageEnvelope,
) -> Result<(), MessagingError> {
    match envelope.take_reference() {
        Some(reference) => reference.complete().await,
        None => Ok(()),
    }
}

/// Resolves the envelope reference as abandoned. A missing reference is a no-op.
pub(crate) async fn abandon_reference(
    envelope: &mut MessageEnvelope,
) -> Result<(), MessagingError> {
    match envelope.take_reference() {
        Some(reference) => reference.abandon().await,
        None => Ok(()),
    }
}

/// Finishes a queue's `close` once its listener is gone: the connection it owns,
/// if any, is closed whatever `unsubscribed` holds. The first error wins.
pub(crate) async fn close_queue<F>(
    unsubscribed: Result<(), MessagingError>,
    owned: Option<F>,
) -> Result<(), MessagingError>
where
    F: Future<Output = Result<(), MessagingError>>,
{
    if let Err(err) = &unsubscribed {
        debug!(error = err.to_string(), "listener teardown failed, closing anyway");
    }
    match owned {
        Some(close) => {
            let closed = close.await;
            unsubscribed.and(closed)
        }
        None => unsubscribed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_capability_rows() {
        assert!(Capabilities::RABBITMQ.peek);
        assert!(Capabilities::RABBITMQ.abandon);
        assert!(!Capabilities::RABBITMQ.move_to_dead_letter);

        assert!(!Capabilities::KAFKA.peek);
        assert!(Capabilities::KAFKA.receive);
        assert!(!Capabilities::KAFKA.abandon);

        assert!(!Capabilities::PUSH_ONLY.receive);
        assert!(Capabilities::PUSH_ONLY.listen);

        for row in [
            Capabilities::RABBITMQ,
            Capabilities::KAFKA,
            Capabilities::PUSH_ONLY,
            Capabilities::MEMORY,
        ] {
            assert!(!row.renew_lock);
        }
    }

    #[tokio::test]
    async fn test_resolving_without_reference_is_noop() {
        let mut envelope = MessageEnvelope::new("Created", None, "x");
        assert_eq!(complete_reference(&mut envelope).await, Ok(()));
        assert_eq!(abandon_reference(&mut envelope).await, Ok(()));
    }

    #[tokio::test]
    async fn test_close_queue_closes_connection_after_failed_unsubscribe() {
        let closed = AtomicBool::new(false);
        let result = close_queue(
            Err(MessagingError::ConsumerError("unsubscribe".into())),
            Some(async {
                closed.store(true, Ordering::SeqCst);
                Err(MessagingError::InternalError)
            }),
        )
        .await;

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(
            result,
            Err(MessagingError::ConsumerError("unsubscribe".into()))
        );
    }

    #[tokio::test]
    async fn test_close_queue_reports_connection_error() {
        let result = close_queue(Ok(()), Some(async { Err(MessagingError::InternalError) })).await;
        assert_eq!(result, Err(MessagingError::InternalError));

        let shared = close_queue(
            Err(MessagingError::InternalError),
            None::<std::future::Ready<Result<(), MessagingError>>>,
        )
        .await;
        assert_eq!(shared, Err(MessagingError::InternalError));
    }
}
