// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::ConnectionOptions,
    envelope::MessageEnvelope,
    errors::MessagingError,
    nats::{connection::NatsConnection, settings::NatsSettings},
    queue::{
        close_queue, unsupported, Capabilities, MessageQueue, MessageReceiver, QueueListener,
    },
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Push-only queue adapter over a NATS subject, optionally in a queue group.
#[derive(Clone)]
pub struct NatsMessageQueue {
    settings: NatsSettings,
    connection: Arc<NatsConnection>,
    owns_connection: bool,
    listener_id: String,
}

impl NatsMessageQueue {
    pub fn new(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        Ok(NatsMessageQueue {
            settings: NatsSettings::from_options(options)?,
            connection: Arc::new(NatsConnection::new(Arc::new(options.clone()))),
            owns_connection: true,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_connection(
        options: &ConnectionOptions,
        connection: Arc<NatsConnection>,
    ) -> Result<Self, MessagingError> {
        Ok(NatsMessageQueue {
            settings: NatsSettings::from_options(options)?,
            connection,
            owns_connection: false,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn connection(&self) -> &Arc<NatsConnection> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for NatsMessageQueue {
    fn name(&self) -> &str {
        &self.settings.topic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PUSH_ONLY
    }

    async fn open(&self) -> Result<(), MessagingError> {
        self.connection.open().await
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
        self.connection
            .publish(ctx, &self.settings.topic, envelope)
            .await
    }

    async fn peek(&self) -> Result<Option<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "peek");
        Ok(None)
    }

    async fn peek_batch(&self, _max: usize) -> Result<Vec<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "peek_batch");
        Ok(vec![])
    }

    async fn receive(&self, _wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "receive");
        Ok(None)
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError> {
        let settings = self.settings.clone();
        let listener_id = self.listener_id.clone();
        let listener = QueueListener::new(&self.connection, receiver, move |connection| {
            Box::new(NatsMessageQueue {
                settings: settings.clone(),
                connection,
                owns_connection: false,
                listener_id: listener_id.clone(),
            }) as Box<dyn MessageQueue>
        });

        self.connection
            .subscribe(
                &self.settings.topic,
                &self.settings.group,
                &self.listener_id,
                listener,
            )
            .await
    }

    async fn end_listen(&self) -> Result<(), MessagingError> {
        self.connection
            .unsubscribe(&self.settings.topic, &self.settings.group, &self.listener_id)
            .await
    }

    async fn complete(&self, _envelope: &mut MessageEnvelope) -> Result<(), MessagingError> {
        unsupported(self.name(), "complete");
        Ok(())
    }

    async fn abandon(&self, _envelope: &mut MessageEnvelope) -> Result<(), MessagingError> {
        unsupported(self.name(), "abandon");
        Ok(())
    }

    async fn renew_lock(
        &self,
        _envelope: &mut MessageEnvelope,
        _lock_timeout: Duration,
    ) -> Result<(), MessagingError> {
        unsupported(self.name(), "renew_lock");
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        _envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        unsupported(self.name(), "move_to_dead_letter");
        Ok(())
    }

    async fn clear(&self) -> Result<(), MessagingError> {
        unsupported(self.name(), "clear");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GROUP, TOPIC};

    fn queue() -> NatsMessageQueue {
        NatsMessageQueue::new(&ConnectionOptions::from_tuples(&[
            (TOPIC, "orders.created"),
            (GROUP, "workers"),
        ]))
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_and_settlement_verbs_are_noops() {
        let queue = queue();
        let mut envelope = MessageEnvelope::new("Created", None, "order-1");

        assert_eq!(queue.name(), "orders.created");
        assert!(queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        assert!(queue.peek_batch(5).await.unwrap().is_empty());
        queue.complete(&mut envelope).await.unwrap();
        queue.move_to_dead_letter(&mut envelope).await.unwrap();
        queue
            .renew_lock(&mut envelope, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(envelope.message, b"order-1");
    }

    #[tokio::test]
    async fn test_closed_queue_cannot_send() {
        let queue = queue();
        let mut envelope = MessageEnvelope::new("Created", None, "order-1");

        assert!(!queue.is_open());
        assert!(matches!(
            queue.send(&Context::new(), &mut envelope).await,
            Err(MessagingError::InvalidState(_))
        ));
        queue.end_listen().await.unwrap();
        queue.close().await.unwrap();
    }
}
