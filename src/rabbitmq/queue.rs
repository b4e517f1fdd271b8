// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::ConnectionOptions,
    envelope::MessageEnvelope,
    errors::MessagingError,
    queue::{
        abandon_reference, close_queue, complete_reference, unsupported, Capabilities,
        MessageQueue, MessageReceiver, QueueListener,
    },
    rabbitmq::{connection::RabbitMqConnection, settings::RabbitMqSettings, topology::AmqpTopology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Queue adapter over a RabbitMQ queue, an exchange, or both.
///
/// Messages are published to the exchange with the configured routing key, or
/// straight to the queue through the default exchange. Consuming verbs need a
/// queue.
#[derive(Clone)]
pub struct RabbitMqMessageQueue {
    settings: RabbitMqSettings,
    connection: Arc<RabbitMqConnection>,
    owns_connection: bool,
    listener_id: String,
}

impl RabbitMqMessageQueue {
    /// Creates a queue with its own connection, resolved from `options`.
    pub fn new(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        let settings = RabbitMqSettings::from_options(options)?;
        Ok(RabbitMqMessageQueue {
            settings,
            connection: Arc::new(RabbitMqConnection::new(Arc::new(options.clone()))),
            owns_connection: true,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    /// Creates a queue on a shared connection. Only the queue-level keys of
    /// `options` are read; the queue never closes the connection.
    pub fn with_connection(
        options: &ConnectionOptions,
        connection: Arc<RabbitMqConnection>,
    ) -> Result<Self, MessagingError> {
        let settings = RabbitMqSettings::from_options(options)?;
        Ok(RabbitMqMessageQueue {
            settings,
            connection,
            owns_connection: false,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn settings(&self) -> &RabbitMqSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<RabbitMqConnection> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for RabbitMqMessageQueue {
    fn name(&self) -> &str {
        self.settings.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RABBITMQ
    }

    async fn open(&self) -> Result<(), MessagingError> {
        self.connection.open().await?;

        if self.settings.auto_create {
            self.connection
                .install(&AmqpTopology::from_settings(&self.settings))
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let unsubscribed = self.end_listen().await;
        close_queue(unsubscribed, self.owns_connection.then(|| self.connection.close())).await
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn send(
        &self,
        ctx: &Context,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let (exchange, routing_key) = self.settings.publish_target();
        self.connection
            .publish(ctx, exchange, routing_key, envelope, self.settings.persistent)
            .await
    }

    async fn peek(&self) -> Result<Option<MessageEnvelope>, MessagingError> {
        let queue = self.settings.require_queue()?;
        Ok(self.connection.peek(queue, 1).await?.into_iter().next())
    }

    async fn peek_batch(&self, max: usize) -> Result<Vec<MessageEnvelope>, MessagingError> {
        let queue = self.settings.require_queue()?;
        self.connection.peek(queue, max).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError> {
        let queue = self.settings.require_queue()?;
        self.connection.receive(queue, wait).await
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError> {
        let queue = self.settings.require_queue()?;

        let settings = self.settings.clone();
        let listener_id = self.listener_id.clone();
        let listener = QueueListener::new(&self.connection, receiver, move |connection| {
            Box::new(RabbitMqMessageQueue {
                settings: settings.clone(),
                connection,
                owns_connection: false,
                listener_id: listener_id.clone(),
            }) as Box<dyn MessageQueue>
        });

        self.connection
            .subscribe(queue, "", &self.listener_id, listener)
            .await
    }

    async fn end_listen(&self) -> Result<(), MessagingError> {
        match &self.settings.queue {
            Some(queue) => {
                self.connection
                    .unsubscribe(queue, "", &self.listener_id)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), MessagingError> {
        complete_reference(envelope).await
    }

    async fn abandon(&self, envelope: &mut MessageEnvelope) -> Result<(), MessagingError> {
        abandon_reference(envelope).await
    }

    async fn renew_lock(
        &self,
        _envelope: &mut MessageEnvelope,
        _lock_timeout: Duration,
    ) -> Result<(), MessagingError> {
        unsupported(self.name(), "renew_lock");
        Ok(())
    }

    /// Dead-lettering in RabbitMQ is configured on the queue through exchange
    /// routing; there is no per-message verb.
    async fn move_to_dead_letter(
        &self,
        _envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        unsupported(self.name(), "move_to_dead_letter");
        Ok(())
    }

    async fn clear(&self) -> Result<(), MessagingError> {
        let queue = self.settings.require_queue()?;
        self.connection.purge(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::settings::{EXCHANGE, QUEUE};

    #[test]
    fn test_construction_validates_settings() {
        assert!(matches!(
            RabbitMqMessageQueue::new(&ConnectionOptions::new()),
            Err(MessagingError::ConfigError(_))
        ));

        let queue =
            RabbitMqMessageQueue::new(&ConnectionOptions::from_tuples(&[(QUEUE, "jobs")])).unwrap();
        assert_eq!(queue.name(), "jobs");
        assert_eq!(queue.capabilities(), Capabilities::RABBITMQ);
        assert!(!queue.is_open());
    }

    #[tokio::test]
    async fn test_publish_only_queue_cannot_consume() {
        let queue =
            RabbitMqMessageQueue::new(&ConnectionOptions::from_tuples(&[(EXCHANGE, "orders")]))
                .unwrap();

        assert!(matches!(
            queue.receive(Duration::from_millis(10)).await,
            Err(MessagingError::ConfigError(_))
        ));
        assert!(matches!(queue.clear().await, Err(MessagingError::ConfigError(_))));
        queue.end_listen().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_verbs_succeed() {
        let queue =
            RabbitMqMessageQueue::new(&ConnectionOptions::from_tuples(&[(QUEUE, "jobs")])).unwrap();
        let mut envelope = MessageEnvelope::new("Created", None, "x");

        queue
            .renew_lock(&mut envelope, Duration::from_secs(1))
            .await
            .unwrap();
        queue.move_to_dead_letter(&mut envelope).await.unwrap();
        queue.complete(&mut envelope).await.unwrap();
    }
}
