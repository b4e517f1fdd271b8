// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQTT Connection
//!
//! One [`AsyncClient`] per connection. Its [`EventLoop`] is driven by a task
//! started in `open`, which waits for the broker's `CONNACK`, keeps the session
//! alive, reconnects, and forwards every incoming publish to a single fan-out
//! loop over a bounded channel, so a slow listener holds back the event loop.
//!
//! Listeners subscribing to the same `(topic, group)` share one broker
//! subscription; it is only removed when the last of them unsubscribes. The
//! broker sends one copy of a publish per matching subscription, and each copy
//! is handed only to the listeners of the subscription it is routed to.

use crate::{
    config::{CommonOptions, ConnectionResolver},
    connection::{admit, closed_while, ConnectionSlot, ConnectionState},
    dispatcher::{fan_out_loop, Inbound},
    envelope::MessageEnvelope,
    errors::MessagingError,
    metrics::MessagingMetrics,
    mqtt::{
        settings::{MqttConfig, REQUEST_CAPACITY},
        topic::{self, FilterRouter},
    },
    queue::{MessageListener, MessageQueueConnection},
    registry::{Detached, Subscription, SubscriptionKey, SubscriptionRegistry},
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use opentelemetry::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a closing connection waits for its `DISCONNECT` to be written.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

type InboundSender = mpsc::Sender<Result<Inbound, MessagingError>>;

struct MqttClient {
    client: AsyncClient,
    config: MqttConfig,
    stop: CancellationToken,
}

pub struct MqttConnection {
    resolver: Arc<dyn ConnectionResolver>,
    slot: ConnectionSlot<MqttClient>,
    registry: Arc<SubscriptionRegistry<String>>,
    changes: Mutex<()>,
    metrics: MessagingMetrics,
}

/// Payload written for an envelope: the JSON envelope, or the bare message.
pub(crate) fn encode(
    envelope: &MessageEnvelope,
    serialized: bool,
) -> Result<Vec<u8>, MessagingError> {
    if serialized {
        envelope.to_json_bytes()
    } else {
        Ok(envelope.message.clone())
    }
}

pub(crate) fn decode(
    topic: &str,
    payload: &[u8],
    serialized: bool,
) -> Result<Inbound, MessagingError> {
    let envelope = if serialized {
        MessageEnvelope::from_json_bytes(payload)?
    } else {
        MessageEnvelope::new("", None, payload.to_vec())
    };
    Ok(Inbound::new(topic, envelope))
}

/// Broker filters of every live subscription.
fn broker_filters(registry: &SubscriptionRegistry<String>) -> BTreeSet<String> {
    registry
        .keys()
        .iter()
        .map(|key| topic::broker_filter(&key.topic, &key.group))
        .collect()
}

/// Whether the listener under `key` owns a message routed to `inbound.route`.
fn owns(key: &SubscriptionKey, inbound: &Inbound) -> bool {
    inbound.route.as_deref() == Some(topic::broker_filter(&key.topic, &key.group).as_str())
}

struct Driver {
    eventloop: EventLoop,
    client: AsyncClient,
    registry: Arc<SubscriptionRegistry<String>>,
    qos: QoS,
    serialized: bool,
    options: CommonOptions,
    inbound: InboundSender,
    router: FilterRouter,
    stop: CancellationToken,
}

impl Driver {
    /// Polls the event loop until stopped. The first `CONNACK`, or the failure of
    /// the last connect attempt, is reported through `connected`.
    async fn run(mut self, connected: oneshot::Sender<Result<(), String>>) {
        let mut connected = Some(connected);
        let attempts = self.options.retries.max(1);
        let mut failures = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => match connected.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => {
                        info!("mqtt connection re-established");
                        if !ack.session_present {
                            self.resubscribe();
                        }
                    }
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(publish.topic.as_ref()).into_owned();
                    let route = self.router.route(&topic, &broker_filters(&self.registry));
                    let inbound = decode(&topic, &publish.payload, self.serialized)
                        .map(|inbound| inbound.routed(route));

                    let sent = tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        sent = self.inbound.send(inbound) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) if connected.is_some() => {
                    failures += 1;
                    if failures >= attempts {
                        if let Some(tx) = connected.take() {
                            let _ = tx.send(Err(err.to_string()));
                        }
                        return;
                    }
                    warn!(
                        error = err.to_string(),
                        attempt = failures,
                        "failure to connect, retrying"
                    );
                    if !self.pause().await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = err.to_string(), "mqtt connection lost, reconnecting");
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }

        self.disconnect().await;
    }

    /// Waits `reconnect_timeout`. False when stopped meanwhile.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.options.reconnect_timeout) => true,
        }
    }

    /// A clean session forgets subscriptions on reconnect; they are sent again.
    fn resubscribe(&self) {
        for filter in broker_filters(&self.registry) {
            if let Err(err) = self.client.try_subscribe(filter.clone(), self.qos) {
                error!(error = err.to_string(), topic = filter, "error to resubscribe");
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let eventloop = &mut self.eventloop;
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    _ => {}
                }
            }
        })
        .await;
    }
}

impl MqttConnection {
    pub fn new(resolver: Arc<dyn ConnectionResolver>) -> Self {
        MqttConnection {
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

    /// Starts the event loop and waits up to `options.connect_timeout` for the
    /// broker to accept the session.
    pub async fn open(&self) -> Result<(), MessagingError> {
        let Some(attempt) = self.slot.attempt()? else {
            return Ok(());
        };

        let options = self.resolver.resolve().await?;
        let common = CommonOptions::from_options(&options)?;
        let config = MqttConfig::from_options(&options)?;
        let uri = config.uri();

        let (client, eventloop) = AsyncClient::new(config.native(), REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (connected_tx, connected_rx) = oneshot::channel();

        let stop = CancellationToken::new();
        let guard = stop.clone().drop_guard();
        let driver = Driver {
            eventloop,
            client: client.clone(),
            registry: self.registry.clone(),
            qos: config.qos,
            serialized: config.serialize_envelope,
            options: common.clone(),
            inbound: inbound_tx,
            router: FilterRouter::default(),
            stop: stop.clone(),
        };
        tokio::spawn(driver.run(connected_tx));

        let reason = match tokio::time::timeout(common.connect_timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(reason),
            Ok(Err(_)) => Some("event loop stopped".to_owned()),
            Err(_) => Some(format!("no CONNACK within {:?}", common.connect_timeout)),
        };
        if let Some(reason) = reason {
            error!(uri = uri, error = reason, "failure to connect");
            return Err(MessagingError::ConnectionError { uri, reason });
        }

        let client = MqttClient {
            client,
            config,
            stop,
        };
        let lease = match attempt.complete(client) {
            Ok(lease) => lease,
            Err(_) => return Err(closed_while("opening")),
        };
        guard.disarm();

        let mut inbound_rx = inbound_rx;
        let messages = stream::poll_fn(move |cx| inbound_rx.poll_recv(cx));
        tokio::spawn(fan_out_loop(
            self.registry.clone(),
            owns,
            self.metrics.clone(),
            lease.cancel.clone(),
            None,
            messages,
        ));

        info!(uri = uri, "mqtt connection opened");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        let Some(teardown) = self.slot.begin_close() else {
            return Ok(());
        };

        for subscription in self.registry.drain() {
            subscription.skip.skip();
            subscription.cancel.cancel();
        }
        if let Some(cancel) = teardown.cancel {
            cancel.cancel();
        }
        if let Some(client) = teardown.client {
            client.stop.cancel();
        }

        self.slot.finish_close();
        info!("mqtt connection closed");
        Ok(())
    }

    pub async fn publish(
        &self,
        _ctx: &Context,
        topic: &str,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let lease = self.slot.lease()?;
        let config = &lease.client.config;

        envelope.sent_time = Utc::now();
        let payload = encode(envelope, config.serialize_envelope)?;

        match lease
            .client
            .client
            .publish(topic, config.qos, config.retain, payload)
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

    /// Adds `listener` to the broker subscription of `(topic, group)`, creating
    /// the subscription if it is the first listener.
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

        let filter = match self.registry.handler_for(&key) {
            Some(filter) => filter,
            None => {
                let filter = topic::broker_filter(topic, group);
                if let Err(err) = lease
                    .client
                    .client
                    .subscribe(filter.clone(), lease.client.config.qos)
                    .await
                {
                    error!(error = err.to_string(), topic = filter, "failure to subscribe");
                    return Err(MessagingError::ConsumerError(err.to_string()));
                }
                filter
            }
        };

        let subscription = Subscription::new(key, filter, listener, lease.cancel.child_token());
        admit(&self.slot, &self.registry, lease.generation, subscription)
            .map_err(|(err, _)| err)?;

        debug!(topic = topic, group = group, listener = listener_id, "subscribed");
        Ok(())
    }

    /// Detaches `listener`. The broker subscription is only removed once no other
    /// listener uses it.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        group: &str,
        listener_id: &str,
    ) -> Result<(), MessagingError> {
        let _changes = self.changes.lock().await;
        let key = SubscriptionKey::new(topic, group, listener_id);

        match self.registry.detach(&key) {
            Detached::NotFound => Ok(()),
            Detached::Shared(_) => {
                debug!(subscription = %key, "listener detached, subscription still in use");
                Ok(())
            }
            Detached::Last(subscription) => {
                subscription.cancel.cancel();
                let Ok(lease) = self.slot.lease() else {
                    return Ok(());
                };
                match lease.client.client.unsubscribe(subscription.handler.clone()).await {
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            topic = subscription.handler,
                            "failure to unsubscribe"
                        );
                        Err(MessagingError::ConsumerError(err.to_string()))
                    }
                    Ok(()) => {
                        debug!(subscription = %key, "unsubscribed");
                        Ok(())
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl MessageQueueConnection for MqttConnection {
    /// MQTT brokers do not expose their topics; these are the topics with live
    /// subscriptions on this connection.
    async fn read_queue_names(&self) -> Result<Vec<String>, MessagingError> {
        self.slot.lease()?;
        let topics: BTreeSet<String> = self
            .registry
            .keys()
            .into_iter()
            .map(|key| key.topic)
            .collect();
        Ok(topics.into_iter().collect())
    }

    /// Topics exist as soon as something is published to them.
    async fn create_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.slot.lease()?;
        debug!(topic = name, "mqtt topics need no creation");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.slot.lease()?;
        debug!(topic = name, "mqtt topics cannot be deleted");
        Ok(())
    }
}
