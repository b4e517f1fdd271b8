// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::ConnectionResolver,
    envelope::MessageEnvelope,
    errors::MessagingError,
    memory::{broker::MemoryBroker, connection::MemoryConnection},
    queue::{
        abandon_reference, close_queue, complete_reference, unsupported, Capabilities,
        MessageQueue, MessageReceiver, QueueListener,
    },
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Queue adapter over an in-process topic.
#[derive(Clone)]
pub struct MemoryMessageQueue {
    name: String,
    connection: Arc<MemoryConnection>,
    owns_connection: bool,
    listener_id: String,
}

impl MemoryMessageQueue {
    /// Creates a queue with its own connection to `broker`.
    pub fn new(name: &str, broker: MemoryBroker, resolver: Arc<dyn ConnectionResolver>) -> Self {
        MemoryMessageQueue {
            name: name.to_owned(),
            connection: Arc::new(MemoryConnection::new(broker, resolver)),
            owns_connection: true,
            listener_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a queue on a connection shared with other queues. The queue does
    /// not close it.
    pub fn with_connection(name: &str, connection: Arc<MemoryConnection>) -> Self {
        MemoryMessageQueue {
            name: name.to_owned(),
            connection,
            owns_connection: false,
            listener_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn connection(&self) -> &Arc<MemoryConnection> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for MemoryMessageQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MEMORY
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
        self.connection.publish(ctx, &self.name, envelope).await
    }

    async fn peek(&self) -> Result<Option<MessageEnvelope>, MessagingError> {
        Ok(self.connection.peek(&self.name, 1).await?.into_iter().next())
    }

    async fn peek_batch(&self, max: usize) -> Result<Vec<MessageEnvelope>, MessagingError> {
        self.connection.peek(&self.name, max).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError> {
        self.connection.receive(&self.name, wait).await
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError> {
        let name = self.name.clone();
        let listener_id = self.listener_id.clone();
        let listener = QueueListener::new(&self.connection, receiver, move |connection| {
            Box::new(MemoryMessageQueue {
                name: name.clone(),
                connection,
                owns_connection: false,
                listener_id: listener_id.clone(),
            }) as Box<dyn MessageQueue>
        });

        self.connection
            .subscribe(&self.name, "", &self.listener_id, listener)
            .await
    }

    async fn end_listen(&self) -> Result<(), MessagingError> {
        self.connection
            .unsubscribe(&self.name, "", &self.listener_id)
            .await
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
        unsupported(&self.name, "renew_lock");
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        _envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        unsupported(&self.name, "move_to_dead_letter");
        Ok(())
    }

    async fn clear(&self) -> Result<(), MessagingError> {
        self.connection.purge(&self.name).await
    }
}
