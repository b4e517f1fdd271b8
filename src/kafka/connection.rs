// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Kafka Connection
//!
//! A [`FutureProducer`] carries every send. Each subscription gets its own
//! [`StreamConsumer`] in the subscription group and its own pull loop; `receive`
//! reads through one lazily created consumer per `(topic, group)`. Topic
//! administration goes through an [`AdminClient`] created on first use.
//!
//! With `options.autocommit` disabled, envelopes carry a cursor and the pull loop
//! commits the offset after the receiver ran.

use crate::{
    config::{redact_uri, CommonOptions, ConnectionResolver},
    connection::{admit, closed_while, ConnectionSlot, ConnectionState},
    dispatcher::{poll_receive, pull_loop, spawn_with_rendezvous, Inbound},
    envelope::{MessageEnvelope, MessageReference, ReferenceKind},
    errors::MessagingError,
    kafka::{
        message::{envelope_from_message, headers_for, KafkaCursor},
        settings::{client_config, consumer_config, KafkaOptions},
    },
    metrics::MessagingMetrics,
    queue::{MessageListener, MessageQueueConnection},
    registry::{Subscription, SubscriptionKey, SubscriptionRegistry},
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, FutureExt};
use opentelemetry::Context;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    consumer::{Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::OwnedMessage,
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig, Message,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

type Poller = Arc<StreamConsumer>;

struct KafkaClient {
    config: ClientConfig,
    kafka: KafkaOptions,
    options: CommonOptions,
    producer: FutureProducer,
    pollers: StdMutex<HashMap<(String, String), Poller>>,
}

impl KafkaClient {
    fn consumer(&self, group: &str) -> Result<StreamConsumer, MessagingError> {
        consumer_config(&self.config, group, self.kafka.autocommit)
            .create()
            .map_err(|err| {
                error!(error = err.to_string(), group = group, "error to create consumer");
                MessagingError::ConsumerError(err.to_string())
            })
    }

    fn poller(&self, topic: &str, group: &str) -> Result<Poller, MessagingError> {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (topic.to_owned(), group.to_owned());
        if let Some(poller) = pollers.get(&key) {
            return Ok(poller.clone());
        }

        let poller = Arc::new(self.consumer(group)?);
        subscribe_consumer(&poller, topic)?;
        pollers.insert(key, poller.clone());
        Ok(poller)
    }

    /// Envelope for a record read by `consumer`, carrying a cursor when offsets
    /// are committed by hand.
    fn envelope(
        &self,
        consumer: &Arc<StreamConsumer>,
        message: &OwnedMessage,
    ) -> MessageEnvelope {
        let envelope = envelope_from_message(message);
        if self.kafka.autocommit {
            return envelope;
        }
        let cursor = KafkaCursor::new(consumer.clone(), message);
        envelope.with_reference(MessageReference::new(ReferenceKind::Kafka(cursor)))
    }
}

/// The record the consumer already has queued, if any. Never waits.
fn try_recv(consumer: &StreamConsumer) -> Result<Option<OwnedMessage>, KafkaError> {
    match consumer.recv().now_or_never() {
        None => Ok(None),
        Some(Ok(message)) => Ok(Some(message.detach())),
        Some(Err(err)) => Err(err),
    }
}

fn subscribe_consumer(consumer: &StreamConsumer, topic: &str) -> Result<(), MessagingError> {
    consumer.subscribe(&[topic]).map_err(|err| {
        error!(error = err.to_string(), topic = topic, "failure to consume");
        MessagingError::ConsumerError(err.to_string())
    })
}

fn admin_error(err: KafkaError) -> MessagingError {
    error!(error = err.to_string(), "kafka admin request failed");
    MessagingError::AdminError(err.to_string())
}

pub struct KafkaConnection {
    resolver: Arc<dyn ConnectionResolver>,
    slot: ConnectionSlot<KafkaClient>,
    registry: SubscriptionRegistry<Arc<StreamConsumer>>,
    admin: Mutex<Option<Arc<AdminClient<DefaultClientContext>>>>,
    metrics: MessagingMetrics,
}

impl KafkaConnection {
    pub fn new(resolver: Arc<dyn ConnectionResolver>) -> Self {
        KafkaConnection {
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

    /// Creates the producer and waits up to `options.connect_timeout` for the
    /// cluster metadata, so an unreachable cluster fails here.
    pub async fn open(&self) -> Result<(), MessagingError> {
        let Some(attempt) = self.slot.attempt()? else {
            return Ok(());
        };

        let options = self.resolver.resolve().await?;
        let common = CommonOptions::from_options(&options)?;
        let kafka = KafkaOptions::from_options(&options)?;
        let config = client_config(&options, &kafka, &common);
        let uri = redact_uri(&kafka.brokers);

        let connection_error = |reason: String| {
            error!(uri = uri, error = reason, "failure to connect");
            MessagingError::ConnectionError {
                uri: uri.clone(),
                reason,
            }
        };

        let producer: FutureProducer = config
            .create()
            .map_err(|err| connection_error(err.to_string()))?;

        let probe = producer.clone();
        let timeout = common.connect_timeout;
        let reached = tokio::task::spawn_blocking(move || {
            probe.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await;
        match reached {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(connection_error(err.to_string())),
            Err(err) => return Err(connection_error(err.to_string())),
        }

        let client = KafkaClient {
            config,
            kafka,
            options: common,
            producer,
            pollers: StdMutex::new(HashMap::new()),
        };
        if attempt.complete(client).is_err() {
            return Err(closed_while("opening"));
        }

        info!(uri = uri, "kafka connection opened");
        Ok(())
    }

    /// Stops every consumer and drops the clients. Unsent records still queued in
    /// the producer are flushed within `options.connect_timeout`.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let Some(teardown) = self.slot.begin_close() else {
            return Ok(());
        };
        let mut first_err = None;

        for subscription in self.registry.drain() {
            subscription.cancel.cancel();
            subscription.handler.unsubscribe();
        }
        if let Some(cancel) = teardown.cancel {
            cancel.cancel();
        }

        if let Some(client) = teardown.client {
            for poller in client
                .pollers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, poller)| poller)
            {
                poller.unsubscribe();
            }

            let producer = client.producer.clone();
            let timeout = client.options.connect_timeout;
            match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = err.to_string(), "error to flush producer");
                    first_err.get_or_insert(MessagingError::PublishingError(err.to_string()));
                }
                Err(err) => {
                    error!(error = err.to_string(), "error to flush producer");
                    first_err.get_or_insert(MessagingError::InternalError);
                }
            }
        }

        self.admin.lock().await.take();

        self.slot.finish_close();
        info!("kafka connection closed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn publish(
        &self,
        _ctx: &Context,
        topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;

        envelope.sent_time = Utc::now();
        let record = FutureRecord::to(topic)
            .key(envelope.message_id.as_str())
            .payload(envelope.message.as_slice())
            .headers(headers_for(envelope));

        match lease
            .client
            .producer
            .send(record, lease.client.options.connect_timeout)
            .await
        {
            Err((err, _)) => {
                error!(error = err.to_string(), topic = topic, "error publishing message");
                Err(MessagingError::PublishingError(err.to_string()))
            }
            Ok(_) => {
                debug!(topic = topic, message = %envelope, "message published");
                self.metrics.record_sent(topic);
                Ok(())
            }
        }
    }

    /// Starts a consumer in `group` and returns once its pull loop is running.
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

        let consumer = Arc::new(lease.client.consumer(group)?);
        subscribe_consumer(&consumer, topic)?;

        let cancel = lease.cancel.child_token();
        let guard = cancel.clone().drop_guard();

        let client = lease.client.clone();
        let messages = stream::unfold(consumer.clone(), move |consumer| {
            let client = client.clone();
            async move {
                // borrowed records are detached before the next await point
                let next = consumer.recv().await.map(|m| m.detach());
                let item = match next {
                    Ok(message) => {
                        let envelope = client.envelope(&consumer, &message);
                        Ok(Inbound::new(message.topic(), envelope))
                    }
                    Err(err) => Err(MessagingError::ConsumerError(err.to_string())),
                };
                Some((item, consumer))
            }
        });

        let subscription = Subscription::new(key, consumer.clone(), listener, cancel.clone());
        let target = subscription.target();
        let metrics = self.metrics.clone();
        let acknowledge = !lease.client.kafka.autocommit;
        let started = spawn_with_rendezvous(lease.client.options.subscribe_timeout, move |ready| {
            pull_loop(target, acknowledge, metrics, cancel, ready, messages)
        })
        .await;
        if let Err(err) = started {
            consumer.unsubscribe();
            return Err(err);
        }

        if let Err((err, _)) = admit(&self.slot, &self.registry, lease.generation, subscription) {
            consumer.unsubscribe();
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
            subscription.handler.unsubscribe();
            debug!(subscription = %key, "unsubscribed");
        }
        Ok(())
    }

    /// Reads the next record of `topic` for `group`, waiting up to `wait`.
    /// Polls the `(topic, group)` consumer every `options.receive_interval`
    /// until a record is ready or `wait` elapses.
    pub async fn receive(
        &self,
        topic: &str,
        group: &str,
        wait: Duration,
    ) -> Result<Option<MessageEnvelope>, MessagingError> {
        let lease = self.slot.lease()?;
        let poller = lease.client.poller(topic, group)?;
        let interval = lease.client.options.receive_interval;
        let slot = &self.slot;

        poll_receive(wait, interval, || {
            let poller = poller.clone();
            async move {
                let lease = slot.lease()?;
                let next = try_recv(&poller).map_err(|err| {
                    error!(error = err.to_string(), topic = topic, "errors consume msg");
                    MessagingError::ConsumerError(err.to_string())
                })?;
                Ok(next.map(|message| lease.client.envelope(&poller, &message)))
            }
        })
        .await
    }

    async fn admin(
        &self,
    ) -> Result<(Arc<AdminClient<DefaultClientContext>>, KafkaOptions), MessagingError> {
        let lease = self.slot.lease()?;
        let mut admin = self.admin.lock().await;

        if let Some(admin) = admin.as_ref() {
            return Ok((admin.clone(), lease.client.kafka.clone()));
        }

        let client: AdminClient<DefaultClientContext> =
            lease.client.config.create().map_err(admin_error)?;
        let client = Arc::new(client);
        debug!("kafka admin client created");

        *admin = Some(client.clone());
        Ok((client, lease.client.kafka.clone()))
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl MessageQueueConnection for KafkaConnection {
    /// Topics of the cluster, without the internal `__` topics.
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError> {
        let (admin, _) = self.admin().await?;
        let timeout = self.slot.lease()?.client.options.connect_timeout;

        let names = tokio::task::spawn_blocking(move || {
            admin.inner().fetch_metadata(None, timeout).map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .map(|topic| topic.name().to_owned())
                    .filter(|name| !name.starts_with("__"))
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|err| MessagingError::AdminError(err.to_string()))?
        .map_err(admin_error)?;

        Ok(names)
    }

    /// Creates the topic with the configured partitions and replication factor.
    /// An existing topic is left as is.
    async fn create_queue(&self, name: &str) -> Result<(), MessagingError> {
        let (admin, kafka) = self.admin().await?;
        let topic = NewTopic::new(
            name,
            kafka.num_partitions,
            TopicReplication::Fixed(kafka.replication_factor),
        );

        let results = admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(admin_error)?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => {
                    error!(topic = topic, error = code.to_string(), "error to create topic");
                    return Err(MessagingError::DeclareQueueError(topic));
                }
            }
        }
        debug!(topic = name, "topic created");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        let (admin, _) = self.admin().await?;

        let results = admin
            .delete_topics(&[name], &AdminOptions::new())
            .await
            .map_err(admin_error)?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
                Err((topic, code)) => {
                    error!(topic = topic, error = code.to_string(), "error to delete topic");
                    return Err(MessagingError::DeleteQueueError(topic));
                }
            }
        }
        debug!(topic = name, "topic deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            ConnectionOptions, MockConnectionResolver, CONNECTION_HOST, CONNECTION_PORT,
            OPTIONS_CONNECT_TIMEOUT,
        },
        dispatcher::tests::RecordingListener,
    };

    fn unreachable() -> KafkaConnection {
        KafkaConnection::new(Arc::new(ConnectionOptions::from_tuples(&[
            (CONNECTION_HOST, "127.0.0.1"),
            (CONNECTION_PORT, "1"),
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
                .publish(&Context::new(), "orders", &mut envelope)
                .await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.subscribe("orders", "g", "l1", listener).await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection
                .receive("orders", "g", Duration::from_millis(10))
                .await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            connection.delete_queue("orders").await,
            Err(MessagingError::InvalidState(_))
        ));
        assert_eq!(connection.subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_open() {
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

    #[tokio::test]
    async fn test_missing_brokers_is_config_error() {
        let mut resolver = MockConnectionResolver::new();
        resolver
            .expect_resolve()
            .returning(|| Ok(ConnectionOptions::new()));
        let connection = KafkaConnection::new(Arc::new(resolver));

        assert!(matches!(
            connection.open().await,
            Err(MessagingError::ConfigError(_))
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_try_recv_does_not_wait_for_records() {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", "127.0.0.1:1")
            .set("group.id", "billing")
            .create()
            .unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(try_recv(&consumer), Ok(None)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
