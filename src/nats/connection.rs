// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # NATS Connection
//!
//! One [`async_nats::Client`] per connection. Every distinct `(subject, group)`
//! gets its own server subscription and fan-out loop; listeners added to an
//! existing pair join its loop. The loop is cancelled when the last of them
//! leaves, and dropping the server subscription unsubscribes it.

use crate::{
    config::{redact_uri, CommonOptions, ConnectionResolver},
    connection::{admit, closed_while, ConnectionSlot, ConnectionState},
    dispatcher::{fan_out_loop, spawn_with_rendezvous, Inbound},
    envelope::MessageEnvelope,
    errors::MessagingError,
    metrics::MessagingMetrics,
    nats::{
        message::{envelope_from_parts, headers_for},
        settings::NatsConfig,
    },
    queue::{MessageListener, MessageQueueConnection},
    registry::{Detached, Subscription, SubscriptionKey, SubscriptionRegistry},
};
use async_nats::Client;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use opentelemetry::Context;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct NatsConnection {
    resolver: Arc<dyn ConnectionResolver>,
    slot: ConnectionSlot<NatsClient>,
    registry: Arc<SubscriptionRegistry<CancellationToken>>,
    changes: Mutex<()>,
    metrics: MessagingMetrics,
}

struct NatsClient {
    client: Client,
    options: CommonOptions,
}

impl NatsConnection {
    pub fn new(resolver: Arc<dyn ConnectionResolver>) -> Self {
        NatsConnection {
            resolver,
            slot: ConnectionSlot::default(),
            registry: Arc::new(SubscriptionRegistry::default()),
            changes: Mutex::new(()),
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

    /// Connects to the server, trying `options.retries` times.
    pub async fn open(&self) -> Result<(), MessagingError> {
        let Some(attempt) = self.slot.attempt()? else {
            return Ok(());
        };

        let options = self.resolver.resolve().await?;
        let common = CommonOptions::from_options(&options)?;
        let config = NatsConfig::from_options(&options)?;
        let uri = redact_uri(&config.uri);

        let attempts = common.retries.max(1);
        let mut failure = String::new();
        let mut connected = None;
        for count in 1..=attempts {
            match config.native(&common).connect(config.uri.as_str()).await {
                Ok(client) => {
                    connected = Some(client);
                    break;
                }
                Err(err) => {
                    failure = err.to_string();
                    warn!(uri = uri, error = failure, attempt = count, "failure to connect");
                    if count < attempts {
                        tokio::time::sleep(common.reconnect_timeout).await;
                    }
                }
            }
        }

        let Some(client) = connected else {
            error!(uri = uri, error = failure, "failure to connect");
            return Err(MessagingError::ConnectionError {
                uri,
                reason: failure,
            });
        };

        let client = NatsClient {
            client,
            options: common,
        };
        if attempt.complete(client).is_err() {
            return Err(closed_while("opening"));
        }

        info!(uri = uri, "nats connection opened");
        Ok(())
    }

    /// Stops every subscription and flushes pending publishes.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let Some(teardown) = self.slot.begin_close() else {
            return Ok(());
        };

        for subscription in self.registry.drain() {
            subscription.skip.skip();
            subscription.cancel.cancel();
            subscription.handler.cancel();
        }
        if let Some(cancel) = teardown.cancel {
            cancel.cancel();
        }

        let mut result = Ok(());
        if let Some(client) = teardown.client {
            if let Err(err) = client.client.flush().await {
                error!(error = err.to_string(), "error flushing nats connection");
                result = Err(MessagingError::PublishingError(err.to_string()));
            }
        }

        self.slot.finish_close();
        info!("nats connection closed");
        result
    }

    pub async fn publish(
        &self,
        _ctx: &Context,
        topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        envelope.sent_time = Utc::now();
        let headers = headers_for(envelope);

        match lease
            .client
            .client
            .publish_with_headers(topic.to_owned(), headers, envelope.message.clone().into())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), topic = topic, "error publishing message");
                Err(MessagingError::PublishingError(err.to_string()))
            }
            Ok(()) => {
                debug!(topic = topic, message = %envelope, "message published");
                self.metrics.record_sent(topic);
                Ok(())
            }
        }
    }

    /// Adds `listener` to the server subscription of `(topic, group)`. The first
    /// listener of a pair creates the subscription and waits for its loop to run.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        listener_id: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;
        let _changes = self.changes.lock().await;

        let key = SubscriptionKey::new(topic, group, listener_id);
        if self.registry.contains(&key) {
            return Err(MessagingError::DuplicateSubscription(key.to_string()));
        }

        let mut started = None;
        let physical = match self.registry.handler_for(&key) {
            Some(physical) => physical,
            None => {
                let client = &lease.client.client;
                let native = if group.is_empty() {
                    client.subscribe(topic.to_owned()).await
                } else {
                    client
                        .queue_subscribe(topic.to_owned(), group.to_owned())
                        .await
                };
                let native = native.map_err(|err| {
                    error!(error = err.to_string(), topic = topic, "failure to subscribe");
                    MessagingError::ConsumerError(err.to_string())
                })?;

                let physical = lease.cancel.child_token();
                let guard = physical.clone().drop_guard();

                let messages = native.map(|message| {
                    let envelope = envelope_from_parts(message.headers.as_ref(), &message.payload);
                    Ok(Inbound::new(message.subject.as_str(), envelope))
                });
                let registry = self.registry.clone();
                let metrics = self.metrics.clone();
                let cancel = physical.clone();
                let (subject, queue_group) = (topic.to_owned(), group.to_owned());
                let _ = spawn_with_rendezvous(lease.client.options.subscribe_timeout, move |ready| {
                    fan_out_loop(
                        registry,
                        move |key: &SubscriptionKey, _: &Inbound| {
                            key.topic == subject && key.group == queue_group
                        },
                        metrics,
                        cancel,
                        Some(ready),
                        messages,
                    )
                })
                .await?;

                started = Some(guard);
                physical
            }
        };

        let cancel = physical.child_token();
        let subscription = Subscription::new(key, physical, listener, cancel);
        admit(&self.slot, &self.registry, lease.generation, subscription)
            .map_err(|(err, _)| err)?;

        if let Some(guard) = started {
            guard.disarm();
        }
        debug!(topic = topic, group = group, listener = listener_id, "subscribed");
        Ok(())
    }

    /// Detaches `listener`; the server subscription goes with the last listener.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        group: &str,
        listener_id: &str,
    ) -> Result<(), MessagingError> {
        let _changes = self.changes.lock().await;
        let key = SubscriptionKey::new(topic, group, listener_id);

        match self.registry.detach(&key) {
            Detached::NotFound => {}
            Detached::Shared(subscription) => {
                subscription.cancel.cancel();
                debug!(subscription = %key, "listener detached, subscription still in use");
            }
            Detached::Last(subscription) => {
                subscription.cancel.cancel();
                subscription.handler.cancel();
                debug!(subscription = %key, "unsubscribed");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl MessageQueueConnection for NatsConnection {
    /// Core NATS keeps no subject catalogue; these are the subjects with live
    /// subscriptions on this connection.
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError> {
        self.slot.lease()?;
        let subjects: BTreeSet<String> = self
            .registry
            .keys()
            .into_iter()
            .map(|key| key.topic)
            .collect();
        Ok(subjects.into_iter().collect())
    }

    async fn create_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.slot.lease()?;
        debug!(subject = name, "nats subjects need no creation");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.slot.lease()?;
        debug!(subject = name, "nats subjects cannot be deleted");
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

    fn unreachable() -> NatsConnection {
        NatsConnection::new(Arc::new(ConnectionOptions::from_tuples(&[
            (CONNECTION_HOST, "127.0.0.1"),
            (CONNECTION_PORT, "1"),
            (OPTIONS_RETRIES, "1"),
            (OPTIONS_CONNECT_TIMEOUT, "2000"),
        ])))
    }

    #[tokio::test]
    async fn test_verbs_require_open_connection() {
        let connection = unreachable();
        let mut envelope = MessageEnvelope::new("Created", None, "x");
        let (listener, _rx) = RecordingListener::new();

        assert!(matches!(
            connection
                .publish(&Context::new(), "orders", &mut envelope)
                .await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.subscribe("orders", "workers", "l1", listener).await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.create_queue("orders").await,
            Err(MessagingError::InvalidState(_))
        ));
        connection.unsubscribe("orders", "workers", "l1").await.unwrap();
        assert_eq!(connection.subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_fails_open() {
        let connection = unreachable();

        assert!(matches!(
            connection.open().await,
            Err(MessagingError::ConnectionError { .. })
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert!(!connection.is_open());
    }
}
