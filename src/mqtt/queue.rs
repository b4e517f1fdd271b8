// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::ConnectionOptions,
    envelope::MessageEnvelope,
    errors::MessagingError,
    mqtt::{connection::MqttConnection, settings::MqttSettings},
    queue::{
        close_queue, unsupported, Capabilities, MessageQueue, MessageReceiver, QueueListener,
    },
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

/// Push-only queue adapter over an MQTT topic filter.
#[derive(Clone)]
pub struct MqttMessageQueue {
    settings: MqttSettings,
    connection: Arc<MqttConnection>,
    owns_connection: bool,
    listener_id: String,
}

impl MqttMessageQueue {
    pub fn new(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        Ok(MqttMessageQueue {
            settings: MqttSettings::from_options(options)?,
            connection: Arc::new(MqttConnection::new(Arc::new(options.clone()))),
            owns_connection: true,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_connection(
        options: &ConnectionOptions,
        connection: Arc<MqttConnection>,
    ) -> Result<Self, MessagingError> {
        Ok(MqttMessageQueue {
            settings: MqttSettings::from_options(options)?,
            connection,
            owns_connection: false,
            listener_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn connection(&self) -> &Arc<MqttConnection> {
        &self.connection
    }
}

#[async_trait]
impl MessageQueue for MqttMessageQueue {
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

    /// Messages are only pushed to listeners; nothing can be pulled.
    async fn receive(&self, _wait: Duration) -> Result<Option<MessageEnvelope>, MessagingError> {
        unsupported(self.name(), "receive");
        Ok(None)
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), MessagingError> {
        let settings = self.settings.clone();
        let listener_id = self.listener_id.clone();
        let listener = QueueListener::new(&self.connection, receiver, move |connection| {
            Box::new(MqttMessageQueue {
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
