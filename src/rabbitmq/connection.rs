// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection
//!
//! One AMQP connection and channel carry every publish and every consumer of a
//! [`RabbitMqConnection`]. Each subscription is a consumer with its own tag and
//! its own pull loop; deliveries are acknowledged after the receiver ran.
//!
//! Administrative operations go through a second AMQP connection opened on first
//! use, so a failing declaration never closes the data channel.

use crate::{
    config::{redact_uri, CommonOptions, ConnectionResolver, OPTIONS_CLIENT_ID},
    connection::{admit, closed_while, ConnectionSlot, ConnectionState},
    dispatcher::{poll_receive, pull_loop, spawn_with_rendezvous, Inbound},
    envelope::MessageEnvelope,
    errors::MessagingError,
    metrics::MessagingMetrics,
    queue::{abandon_reference, MessageListener, MessageQueueConnection},
    rabbitmq::{
        channel::{amqp_uri, close_amqp_channel, new_amqp_channel},
        consumer, publisher,
        topology::{self, AmqpTopology, QueueDefinition},
    },
    registry::{Subscription, SubscriptionKey, SubscriptionRegistry},
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, QueuePurgeOptions},
    types::FieldTable,
    Channel, Connection,
};
use opentelemetry::Context;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection name reported to the broker when `options.client_id` is not set.
pub const DEFAULT_CONNECTION_NAME: &str = "messaging";

struct AmqpClient {
    uri: String,
    name: String,
    options: CommonOptions,
    connection: Connection,
    channel: Channel,
}

struct AdminClient {
    connection: Connection,
    channel: Channel,
}

pub struct RabbitMqConnection {
    resolver: Arc<dyn ConnectionResolver>,
    slot: ConnectionSlot<AmqpClient>,
    registry: SubscriptionRegistry<String>,
    admin: Mutex<Option<AdminClient>>,
    known_queues: StdMutex<BTreeSet<String>>,
    metrics: MessagingMetrics,
}

/// Cancels a consumer that was started but never registered.
struct PendingConsumer {
    channel: Channel,
    tag: String,
    armed: bool,
}

impl Drop for PendingConsumer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let tag = std::mem::take(&mut self.tag);
            handle.spawn(async move {
                let _ = cancel_consumer(&channel, &tag).await;
            });
        }
    }
}

async fn cancel_consumer(channel: &Channel, tag: &str) -> Result<(), MessagingError> {
    match channel.basic_cancel(tag, BasicCancelOptions::default()).await {
        Err(err) => {
            warn!(error = err.to_string(), consumer = tag, "error to cancel consumer");
            Err(MessagingError::ConsumerError(err.to_string()))
        }
        _ => {
            debug!(consumer = tag, "consumer cancelled");
            Ok(())
        }
    }
}

impl RabbitMqConnection {
    pub fn new(resolver: Arc<dyn ConnectionResolver>) -> Self {
        RabbitMqConnection {
            resolver,
            slot: ConnectionSlot::default(),
            registry: SubscriptionRegistry::default(),
            admin: Mutex::new(None),
            known_queues: StdMutex::new(BTreeSet::new()),
            metrics: MessagingMetrics::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    pub fn is_open(&self) -> bool {
        self.slot.is_open()
    }

    /// Counters of the messages sent and dispatched through this connection.
    pub fn metrics(&self) -> &MessagingMetrics {
        &self.metrics
    }

    pub async fn open(&self) -> Result<(), MessagingError> {
        let Some(attempt) = self.slot.attempt()? else {
            return Ok(());
        };

        let options = self.resolver.resolve().await?;
        let common = CommonOptions::from_options(&options)?;
        let uri = amqp_uri(&options)?;
        let name = options
            .get_or(OPTIONS_CLIENT_ID, DEFAULT_CONNECTION_NAME)
            .to_owned();

        let (connection, channel) = new_amqp_channel(&uri, &name, &common).await?;
        info!(uri = redact_uri(&uri), "rabbitmq connection opened");

        let client = AmqpClient {
            uri,
            name,
            options: common,
            connection,
            channel,
        };
        if let Err(late) = attempt.complete(client) {
            let _ = close_amqp_channel(&late.connection, &late.channel).await;
            return Err(closed_while("opening"));
        }

        Ok(())
    }

    /// Cancels every consumer, then closes the channel and both connections.
    /// Every step is attempted; the first failure is returned.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let Some(teardown) = self.slot.begin_close() else {
            return Ok(());
        };
        let mut first_err = None;

        let subscriptions = self.registry.drain();
        for subscription in &subscriptions {
            subscription.cancel.cancel();
        }
        if let Some(cancel) = teardown.cancel {
            cancel.cancel();
        }

        if let Some(client) = teardown.client {
            for subscription in &subscriptions {
                if let Err(err) = cancel_consumer(&client.channel, &subscription.handler).await {
                    first_err.get_or_insert(err);
                }
            }
            if let Err(err) = close_amqp_channel(&client.connection, &client.channel).await {
                first_err.get_or_insert(err);
            }
        }

        if let Some(admin) = self.admin.lock().await.take() {
            if let Err(err) = close_amqp_channel(&admin.connection, &admin.channel).await {
                first_err.get_or_insert(err);
            }
        }
        self.known_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.slot.finish_close();
        info!("rabbitmq connection closed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        envelope: &mut MessageEnvelope,
        persistent: bool,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        envelope.sent_time = Utc::now();
        let properties = publisher::properties_for(ctx, envelope, persistent);
        publisher::publish(
            &lease.client.channel,
            exchange,
            routing_key,
            properties,
            envelope,
        )
        .await?;

        let topic = if exchange.is_empty() { routing_key } else { exchange };
        self.metrics.record_sent(topic);
        Ok(())
    }

    /// Starts a consumer on `queue` and returns once its pull loop is running.
    pub async fn subscribe(
        &self,
        queue: &str,
        group: &str,
        listener_id: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        let key = SubscriptionKey::new(queue, group, listener_id);
        if self.registry.contains(&key) {
            return Err(MessagingError::DuplicateSubscription(key.to_string()));
        }

        let tag = format!("{}-{}", listener_id, Uuid::new_v4().simple());
        let native = match lease
            .client
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "failure to consume");
                return Err(MessagingError::ConsumerError(err.to_string()));
            }
            Ok(native) => native,
        };

        let mut pending = PendingConsumer {
            channel: lease.client.channel.clone(),
            tag: tag.clone(),
            armed: true,
        };
        let cancel = lease.cancel.child_token();
        let guard = cancel.clone().drop_guard();

        let topic = queue.to_owned();
        let messages = native.map(move |delivery| match delivery {
            Ok(delivery) => {
                let (ctx, envelope) = consumer::envelope_from_delivery(delivery);
                Ok(Inbound::new(&topic, envelope).with_context(ctx))
            }
            Err(err) => Err(MessagingError::ConsumerError(err.to_string())),
        });

        let subscription = Subscription::new(key, tag, listener, cancel.clone());
        let target = subscription.target();
        let metrics = self.metrics.clone();
        let _ = spawn_with_rendezvous(lease.client.options.subscribe_timeout, move |ready| {
            pull_loop(target, true, metrics, cancel, ready, messages)
        })
        .await?;

        admit(&self.slot, &self.registry, lease.generation, subscription)
            .map_err(|(err, _)| err)?;

        pending.armed = false;
        guard.disarm();
        debug!(queue = queue, listener = listener_id, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        queue: &str,
        group: &str,
        listener_id: &str,
    ) -> Result<(), MessagingError> {
        let key = SubscriptionKey::new(queue, group, listener_id);
        let Some(subscription) = self.registry.remove(&key) else {
            return Ok(());
        };

        subscription.skip.skip();
        subscription.cancel.cancel();

        match self.slot.lease() {
            Ok(lease) => cancel_consumer(&lease.client.channel, &subscription.handler).await,
            Err(_) => Ok(()),
        }
    }

    /// Declares the topology on the data channel and remembers its queues.
    pub async fn install(&self, topology: &AmqpTopology) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;
        topology.install(&lease.client.channel).await?;
        self.remember(topology.queue_names());
        Ok(())
    }

    /// Takes the next message of `queue` without waiting.
    pub async fn get(&self, queue: &str) -> Result<Option<MessageEnvelope>, MessagingError> {
        let lease = self.slot.lease()?;

        match lease
            .client
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "errors consume msg");
                Err(MessagingError::ConsumerError(err.to_string()))
            }
            Ok(Some(message)) => {
                let (_, envelope) = consumer::envelope_from_delivery(message.delivery);
                Ok(Some(envelope))
            }
            Ok(None) => Ok(None),
        }
    }

    /// Takes the next message of `queue`, waiting up to `wait`.
    pub async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<MessageEnvelope>, MessagingError> {
        let interval = self.slot.lease()?.client.options.receive_interval;
        poll_receive(wait, interval, move || self.get(queue)).await
    }

    /// Gets up to `max` messages and puts them all back.
    pub async fn peek(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<MessageEnvelope>, MessagingError> {
        let mut taken = Vec::new();
        while taken.len() < max {
            match self.get(queue).await {
                Ok(Some(envelope)) => taken.push(envelope),
                Ok(None) => break,
                Err(err) => {
                    requeue_all(&mut taken).await;
                    return Err(err);
                }
            }
        }

        let peeked = taken.iter().map(MessageEnvelope::detached_copy).collect();
        requeue_all(&mut taken).await;
        Ok(peeked)
    }

    pub async fn purge(&self, queue: &str) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;
        match lease
            .client
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to purge the queue");
                Err(MessagingError::ConsumerError(err.to_string()))
            }
            Ok(purged) => {
                debug!(queue = queue, purged = purged, "queue purged");
                Ok(())
            }
        }
    }

    fn remember(&self, queues: impl IntoIterator<Item = String>) {
        self.known_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(queues);
    }

    async fn admin_channel(&self) -> Result<Channel, MessagingError> {
        let lease = self.slot.lease()?;
        let mut admin = self.admin.lock().await;

        if let Some(admin) = admin.as_ref() {
            return Ok(admin.channel.clone());
        }

        let name = format!("{}-admin", lease.client.name);
        let (connection, channel) =
            new_amqp_channel(&lease.client.uri, &name, &lease.client.options).await?;
        debug!("rabbitmq admin connection opened");

        *admin = Some(AdminClient {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }
}

async fn requeue_all(envelopes: &mut [MessageEnvelope]) {
    for envelope in envelopes.iter_mut() {
        if let Err(err) = abandon_reference(envelope).await {
            error!(error = err.to_string(), message = %envelope, "error to requeue peeked msg");
        }
    }
}

#[async_trait]
impl MessageQueueConnection for RabbitMqConnection {
    /// AMQP has no way to list queues; these are the queues this connection
    /// declared or created since it was opened.
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError> {
        self.slot.lease()?;
        Ok(self
            .known_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect())
    }

    async fn create_queue(&self, name: &str) -> Result<(), MessagingError> {
        let channel = self.admin_channel().await?;
        topology::declare_queue(&channel, &QueueDefinition::new(name).durable(true)).await?;
        self.remember([name.to_owned()]);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        let channel = self.admin_channel().await?;
        topology::delete_queue(&channel, name).await?;
        self.known_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            ConnectionOptions, CONNECTION_HOST, CONNECTION_PORT, OPTIONS_CONNECT_TIMEOUT,
            OPTIONS_RETRIES,
        },
        dispatcher::tests::RecordingListener,
    };

    fn unreachable() -> RabbitMqConnection {
        RabbitMqConnection::new(Arc::new(ConnectionOptions::from_tuples(&[
            (CONNECTION_HOST, "127.0.0.1"),
            (CONNECTION_PORT, "1"),
            (OPTIONS_RETRIES, "1"),
            (OPTIONS_CONNECT_TIMEOUT, "500"),
        ])))
    }

    #[tokio::test]
    async fn test_verbs_require_open_connection() {
        let connection = unreachable();
        let mut envelope = MessageEnvelope::new("Created", None, "x");
        let (listener, _rx) = RecordingListener::new();

        assert!(matches!(
            connection
                .publish(&Context::new(), "orders", "", &mut envelope, false)
                .await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.subscribe("jobs", "", "l1", listener).await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.get("jobs").await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.read_queue_names().await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.create_queue("jobs").await,
            Err(MessagingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_open_stays_closed() {
        let connection = unreachable();

        assert!(matches!(
            connection.open().await,
            Err(MessagingError::ConnectionError { .. })
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.is_open());

        connection.close().await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let connection = unreachable();
        connection.unsubscribe("jobs", "", "l1").await.unwrap();
    }
}
