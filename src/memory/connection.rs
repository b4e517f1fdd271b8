// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Connection
//!
//! Connection manager over a [`MemoryBroker`]. Behaves like a consumer-group
//! broker with explicit acknowledgment: every subscription runs its own pull
//! loop, and subscriptions to the same topic compete for its messages.

use crate::{
    config::{CommonOptions, ConnectionResolver},
    connection::{admit, closed_while, ConnectionSlot, ConnectionState},
    dispatcher::{poll_receive, pull_loop, spawn_with_rendezvous, Inbound},
    envelope::MessageEnvelope,
    errors::MessagingError,
    memory::broker::MemoryBroker,
    metrics::MessagingMetrics,
    queue::{MessageListener, MessageQueueConnection},
    registry::{Subscription, SubscriptionKey, SubscriptionRegistry},
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

struct MemoryClient {
    broker: MemoryBroker,
    options: CommonOptions,
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    resolver: Arc<dyn ConnectionResolver>,
    slot: ConnectionSlot<MemoryClient>,
    registry: SubscriptionRegistry<()>,
    admin: Mutex<Option<MemoryBroker>>,
    metrics: MessagingMetrics,
}

impl MemoryConnection {
    pub fn new(broker: MemoryBroker, resolver: Arc<dyn ConnectionResolver>) -> Self {
        MemoryConnection {
            broker,
            resolver,
            slot: ConnectionSlot::default(),
            registry: SubscriptionRegistry::default(),
            admin: Mutex::new(None),
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
        let options = CommonOptions::from_options(&options)?;

        if !self.broker.is_available() {
            error!("memory broker is unavailable");
            return Err(MessagingError::ConnectionError {
                uri: "memory://".to_owned(),
                reason: "broker is unavailable".to_owned(),
            });
        }

        let client = MemoryClient {
            broker: self.broker.clone(),
            options,
        };
        if attempt.complete(client).is_err() {
            return Err(closed_while("opening"));
        }

        info!("memory connection opened");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        let Some(teardown) = self.slot.begin_close() else {
            return Ok(());
        };

        for subscription in self.registry.drain() {
            subscription.cancel.cancel();
        }
        if let Some(cancel) = teardown.cancel {
            cancel.cancel();
        }
        self.admin.lock().await.take();

        self.slot.finish_close();
        info!("memory connection closed");
        Ok(())
    }

    pub async fn publish(
        &self,
        _ctx: &Context,
        topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        envelope.sent_time = Utc::now();
        lease.client.broker.publish(topic, envelope);
        self.metrics.record_sent(topic);

        debug!(topic = topic, message = %envelope, "message published");
        Ok(())
    }

    /// Starts a pull loop for `listener` and returns once it is consuming.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        listener_id: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        let key = SubscriptionKey::new(topic, group, listener_id);
        if self.registry.contains(&key) {
            return Err(MessagingError::DuplicateSubscription(key.to_string()));
        }

        let cancel = lease.cancel.child_token();
        let guard = cancel.clone().drop_guard();

        let messages = stream::unfold(
            (lease.client.broker.clone(), topic.to_owned()),
            |(broker, topic)| async move {
                let envelope = broker.take(&topic).await;
                let inbound = Inbound::new(&topic, envelope);
                Some((Ok(inbound), (broker, topic)))
            },
        );

        let subscription = Subscription::new(key, (), listener, cancel.clone());
        let target = subscription.target();
        let metrics = self.metrics.clone();
        let _ = spawn_with_rendezvous(lease.client.options.subscribe_timeout, move |ready| {
            pull_loop(target, true, metrics, cancel, ready, messages)
        })
        .await?;

        if let Err((err, stale)) = admit(&self.slot, &self.registry, lease.generation, subscription)
        {
            if let Some(stale) = stale {
                stale.cancel.cancel();
            }
            return Err(err);
        }

        guard.disarm();
        debug!(topic = topic, group = group, listener = listener_id, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        topic: &str,
        group: &str,
        listener_id: &str,
    ) -> Result<(), MessagingError> {
        let key = SubscriptionKey::new(topic, group, listener_id);
        if let Some(subscription) = self.registry.remove(&key) {
            subscription.skip.skip();
            subscription.cancel.cancel();
            debug!(subscription = %key, "unsubscribed");
        }
        Ok(())
    }

    /// Takes the next message of `topic`, waiting up to `wait`.
    pub async fn receive(
        &self,
        topic: &str,
        wait: Duration,
    ) -> Result<Option<MessageEnvelope>, MessagingError> {
        let interval = self.slot.lease()?.client.options.receive_interval;
        let slot = &self.slot;
        poll_receive(wait, interval, move || async move {
            let lease = slot.lease()?;
            Ok(lease.client.broker.try_take(topic))
        })
        .await
    }

    pub async fn peek(
        &self,
        topic: &str,
        max: usize,
    ) -> Result<Vec<MessageEnvelope>, MessagingError> {
        let lease = self.slot.lease()?;
        Ok(lease.client.broker.peek(topic, max))
    }

    pub async fn purge(&self, topic: &str) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;
        let purged = lease.client.broker.purge(topic);
        debug!(topic = topic, purged = purged, "topic purged");
        Ok(())
    }

    async fn admin(&self) -> Result<MemoryBroker, MessagingError> {
        let lease = self.slot.lease()?;
        let mut admin = self.admin.lock().await;
        Ok(admin
            .get_or_insert_with(|| lease.client.broker.clone())
            .clone())
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl MessageQueueConnection for MemoryConnection {
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError> {
        Ok(self.admin().await?.topics())
    }

    async fn create_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.admin().await?.create_topic(name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        if !self.admin().await?.delete_topic(name) {
            debug!(topic = name, "topic to delete does not exist");
        }
        Ok(())
    }
}
