// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::ConnectionOptions,
    envelope::MessageEnvelope,
    errors::MessagingError,
    kafka::{connection::KafkaConnection, settings::KafkaSettings},
    queue::{
        abandon_reference, close_queue, complete_reference, unsupported, Capabilities,
        MessageQueue, MessageQueueConnection, MessageReceiver, QueueListener,
    },
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Queue adapter over one Kafka topic, consumed in one consumer group.
#[derive(Clone)]
pub struct KafkaMessageQueue {
    settings: KafkaSettings,
    connection: Arc<KafkaConnection>,
    owns_connection: bool,
    listener_id: String,
}

impl KafkaMessageQueue {
    pub fn new(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        Ok(KafkaMessageQueue {
            settings: KafkaSettings::from_options(options)?,
            connection: Arc::new(KafkaConnection::new(Arc::new(options.clone()))),
            owns_connection: true,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_connection(
        options: &ConnectionOptions,
        connection: Arc<KafkaConnection>,
    ) -> Result<Self, MessagingError> {
        Ok(KafkaMessageQueue {
            settings: KafkaSettings::from_options(options)?,
            connection,
            owns_connection: false,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Arc<KafkaConnection> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for KafkaMessageQueue {
    fn name(&self) -> &str {
        &self.settings.topic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KAFKA
    }

    async fn open(&self) -> Result<(), MessagingError> {
        self.connection.open().await?;
        if self.settings.auto_create {
            self.connection.create_queue(&self.settings.topic).await?;
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
        self.connection
            .publish(ctx, &self.settings.topic, envelope)
            .await
    }

    /// Kafka has no random access to pending records.
    async fn peek(&self) -> Result<Option<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "peek");
        Ok(None)
    }

    async fn peek_batch(&self, _max: usize) -> Result<Vec<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "peek_batch");
        Ok(vec![])
    }

    async fn receive(&self, wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError> {
        self.connection
            .receive(&self.settings.topic, &self.settings.group, wait)
            .await
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError> {
        let settings = self.settings.clone();
        let listener_id = self.listener_id.clone();
        let listener = QueueListener::new(&self.connection, receiver, move |connection| {
            Box::new(KafkaMessageQueue {
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

    async fn complete(&self, envelope: &mut MessageEnvelope) -> Result<(), MessagingError> {
        complete_reference(envelope).await
    }

    /// Leaving the offset uncommitted is all Kafka offers; the record comes back
    /// after a rebalance or restart. The cursor is dropped so the dispatch loop
    /// cannot commit it afterwards.
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

    /// No dead-letter topic is managed here. The offset stays uncommitted, as
    /// with [`abandon`](MessageQueue::abandon).
    async fn move_to_dead_letter(
        &self,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        unsupported(self.name(), "move_to_dead_letter");
        abandon_reference(envelope).await
    }

    async fn clear(&self) -> Result<(), MessagingError> {
        unsupported(self.name(), "clear");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{GROUP, TOPIC},
        envelope::{MessageReference, ReferenceKind},
        kafka::message::tests::cursor,
    };

    fn received(payload: &str) -> MessageEnvelope {
        MessageEnvelope::new("Created", None, payload)
            .with_reference(MessageReference::new(ReferenceKind::Kafka(cursor())))
    }

    fn queue() -> KafkaMessageQueue {
        KafkaMessageQueue::new(&ConnectionOptions::from_tuples(&[
            (TOPIC, "orders"),
            (GROUP, "billing"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_queue_reports_topic_and_capabilities() {
        let queue = queue();
        assert_eq!(queue.name(), "orders");
        assert_eq!(queue.settings().group, "billing");
        assert_eq!(queue.capabilities(), Capabilities::KAFKA);
        assert!(!queue.is_open());
    }

    #[tokio::test]
    async fn test_unsupported_verbs_leave_envelope_untouched() {
        let queue = queue();
        let mut envelope = MessageEnvelope::new("Created", None, "order-1");

        assert!(queue.peek().await.unwrap().is_none());
        assert!(queue.peek_batch(10).await.unwrap().is_empty());
        queue.abandon(&mut envelope).await.unwrap();
        queue
            .renew_lock(&mut envelope, Duration::from_secs(1))
            .await
            .unwrap();
        queue.move_to_dead_letter(&mut envelope).await.unwrap();
        queue.clear().await.unwrap();

        assert_eq!(envelope.message, b"order-1");
    }

    #[tokio::test]
    async fn test_closed_queue_cannot_send() {
        let queue = queue();
        let mut envelope = MessageEnvelope::new("Created", None, "order-1");

        assert!(matches!(
            queue.send(&Context::new(), &mut envelope).await,
            Err(MessagingError::InvalidState(_))
        ));
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandon_drops_cursor_without_commit() {
        let queue = queue();
        let mut envelope = received("order-1");
        assert!(envelope.has_reference());

        queue.abandon(&mut envelope).await.unwrap();
        assert!(!envelope.has_reference());

        // The dispatch loop acks whatever is left; nothing is left.
        complete_reference(&mut envelope).await.unwrap();
        assert_eq!(envelope.message, b"order-1");
    }

    #[tokio::test]
    async fn test_dead_letter_leaves_offset_uncommitted() {
        let queue = queue();
        let mut envelope = received("order-2");

        queue.move_to_dead_letter(&mut envelope).await.unwrap();
        assert!(!envelope.has_reference());
        queue.abandon(&mut envelope).await.unwrap();
    }
}
