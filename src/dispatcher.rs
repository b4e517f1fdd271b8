// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! The concurrent side of a subscription. Each broker turns its native consumer
//! into a stream of [`Inbound`] messages and hands it to one of two loops:
//!
//! - [`pull_loop`] for exclusive subscriptions (RabbitMQ consumers, Kafka consumer
//!   groups, the memory broker), one loop per subscription;
//! - [`fan_out_loop`] for physical subscriptions shared by several listeners (NATS
//!   subjects, the MQTT client), which looks up the live listeners for every message.
//!
//! A failing or panicking receiver is logged and counted; the loop keeps going.
//! Loops stop when their cancellation token fires or the native stream ends.

use crate::{
    envelope::MessageEnvelope,
    errors::MessagingError,
    metrics::MessagingMetrics,
    queue::{abandon_reference, complete_reference},
    registry::{SubscriptionKey, SubscriptionRegistry, Target},
};
use futures_util::{FutureExt, Stream, StreamExt};
use opentelemetry::Context;
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::pin,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Topic attribute for messages of a shared subscription that failed to decode.
const UNDECODED_TOPIC: &str = "unknown";

/// A native message already converted to an envelope.
pub(crate) struct Inbound {
    pub context: Context,
    pub topic: String,
    pub envelope: MessageEnvelope,
    /// The physical subscription this copy was delivered for, when the broker
    /// sends one copy per overlapping subscription.
    pub route: Option<String>,
}

impl Inbound {
    pub fn new(topic: &str, envelope: MessageEnvelope) -> Self {
        Inbound {
            context: Context::current(),
            topic: topic.to_owned(),
            envelope,
            route: None,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn routed(mut self, route: Option<String>) -> Self {
        self.route = route;
        self
    }
}

/// Hands one message to a listener. When `acknowledge` is set, whatever reference
/// the listener left unresolved is completed afterwards, whatever the outcome.
pub(crate) async fn deliver(
    target: &Target,
    acknowledge: bool,
    metrics: &MessagingMetrics,
    inbound: Inbound,
) {
    let Inbound {
        context,
        topic,
        mut envelope,
        ..
    } = inbound;

    if target.skip.is_skipped() {
        debug!(subscription = %target.key, "listener detached, dropping message");
        if let Err(err) = abandon_reference(&mut envelope).await {
            error!(error = err.to_string(), subscription = %target.key, "error to requeue msg");
        }
        return;
    }

    metrics.record_received(&topic);

    let outcome = AssertUnwindSafe(target.listener.on_message(&context, &topic, &mut envelope))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => debug!(message = %envelope, "message successfully processed"),
        Ok(Err(err)) => {
            error!(
                error = err.to_string(),
                subscription = %target.key,
                message = %envelope,
                "receiver failed to process message"
            );
            metrics.record_failed(&topic);
        }
        Err(_) => {
            error!(
                subscription = %target.key,
                message = %envelope,
                "receiver panicked while processing message"
            );
            metrics.record_failed(&topic);
        }
    }

    if acknowledge {
        if let Err(err) = complete_reference(&mut envelope).await {
            error!(error = err.to_string(), subscription = %target.key, "error to ack msg");
        }
    }
}

/// Dispatch loop of an exclusive subscription.
pub(crate) async fn pull_loop<S>(
    target: Target,
    acknowledge: bool,
    metrics: MessagingMetrics,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
    stream: S,
) where
    S: Stream<Item = Result<Inbound, MessagingError>>,
{
    let mut stream = pin!(stream);

    debug!(subscription = %target.key, "dispatch loop started");
    let _ = ready.send(());

    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                None => {
                    warn!(subscription = %target.key, "native consumer stream ended");
                    break;
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), subscription = %target.key, "errors consume msg");
                    metrics.record_failed(&target.key.topic);
                    continue;
                }
                Some(Ok(inbound)) => inbound,
            },
        };

        deliver(&target, acknowledge, &metrics, inbound).await;
    }

    debug!(subscription = %target.key, "dispatch loop stopped");
}

/// Dispatch loop of a physical subscription shared by several listeners.
///
/// For each message the registry is searched for the live listeners it `matches`;
/// each of them gets its own copy of the envelope. Push-only brokers have nothing
/// to acknowledge, so copies carry no reference.
pub(crate) async fn fan_out_loop<H, S, M>(
    registry: Arc<SubscriptionRegistry<H>>,
    matches: M,
    metrics: MessagingMetrics,
    cancel: CancellationToken,
    ready: Option<oneshot::Sender<()>>,
    stream: S,
) where
    S: Stream<Item = Result<Inbound, MessagingError>>,
    M: Fn(&SubscriptionKey, &Inbound) -> bool,
{
    let mut stream = pin!(stream);

    if let Some(ready) = ready {
        let _ = ready.send(());
    }

    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                None => {
                    warn!("native subscription stream ended");
                    break;
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    metrics.record_failed(UNDECODED_TOPIC);
                    continue;
                }
                Some(Ok(inbound)) => inbound,
            },
        };

        let targets = registry.targets(|key| matches(key, &inbound));
        if targets.is_empty() {
            debug!(topic = inbound.topic, "no listener for message, dropping");
            continue;
        }

        for target in &targets {
            let copy = Inbound {
                context: inbound.context.clone(),
                topic: inbound.topic.clone(),
                envelope: inbound.envelope.detached_copy(),
                route: inbound.route.clone(),
            };
            deliver(target, false, &metrics, copy).await;
        }
    }

    debug!("fan-out loop stopped");
}

/// Spawns a dispatch loop and waits until it signals that it is consuming.
///
/// A loop that exits before signalling drops its sender, which is reported as an
/// error rather than waited on. A loop that neither signals nor exits within
/// `timeout` is aborted.
pub(crate) async fn spawn_with_rendezvous<F, Fut>(
    timeout: Duration,
    start: F,
) -> Result<JoinHandle<()>, MessagingError>
where
    F: FnOnce(oneshot::Sender<()>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::spawn(start(ready_tx));

    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(_)) => Err(MessagingError::ConsumerError(
            "dispatch loop exited before it started consuming".to_owned(),
        )),
        Err(_) => {
            handle.abort();
            Err(MessagingError::ConsumerError(format!(
                "dispatch loop was not ready after {:?}",
                timeout
            )))
        }
    }
}

/// Polls `attempt` every `interval` until it yields a message or `wait` elapses.
pub(crate) async fn poll_receive<F, Fut>(
    wait: Duration,
    interval: Duration,
    mut attempt: F,
) -> Result<Option<MessageEnvelope>, MessagingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<MessageEnvelope>, MessagingError>>,
{
    let deadline = Instant::now() + wait;

    loop {
        if let Some(envelope) = attempt().await? {
            return Ok(Some(envelope));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        memory::MemoryBroker,
        queue::MessageListener,
        registry::{Detached, SkipFlag, Subscription},
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records payloads; fails on `fail` and panics on `panic`.
    pub(crate) struct RecordingListener {
        pub seen: Mutex<Vec<String>>,
        pub notify: mpsc::UnboundedSender<String>,
    }

    impl RecordingListener {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (notify, rx) = mpsc::unbounded_channel();
            (
                Arc::new(RecordingListener {
                    seen: Mutex::new(vec![]),
                    notify,
                }),
                rx,
            )
        }

        pub fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageListener for RecordingListener {
        async fn on_message(
            &self,
            _ctx: &Context,
            _topic: &str,
            envelope: &mut MessageEnvelope,
        ) -> Result<(), MessagingError> {
            let payload = envelope.message_as_string()?;
            self.seen.lock().unwrap().push(payload.clone());
            let _ = self.notify.send(payload.clone());
            match payload.as_str() {
                "fail" => Err(MessagingError::ConsumerError("rejected".into())),
                "panic" => panic!("receiver bug"),
                _ => Ok(()),
            }
        }
    }

    fn target(listener: Arc<dyn MessageListener>) -> Target {
        Target {
            key: SubscriptionKey::new("orders", "", "l1"),
            listener,
            skip: SkipFlag::default(),
        }
    }

    fn inbound(payload: &str) -> Result<Inbound, MessagingError> {
        Ok(Inbound::new(
            "orders",
            MessageEnvelope::new("Created", None, payload),
        ))
    }

    #[tokio::test]
    async fn test_pull_loop_survives_failing_and_panicking_receiver() {
        let (listener, _rx) = RecordingListener::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let messages = stream::iter(vec![
            inbound("first"),
            inbound("fail"),
            Err(MessagingError::ParsePayloadError("garbage".into())),
            inbound("panic"),
            inbound("last"),
        ]);

        pull_loop(
            target(listener.clone()),
            false,
            MessagingMetrics::new(),
            CancellationToken::new(),
            ready_tx,
            messages,
        )
        .await;

        assert!(ready_rx.await.is_ok());
        assert_eq!(listener.seen(), vec!["first", "fail", "panic", "last"]);
    }

    #[tokio::test]
    async fn test_pull_loop_stops_on_cancel() {
        let (listener, mut rx) = RecordingListener::new();
        let (tx, messages) = mpsc::unbounded_channel::<Result<Inbound, MessagingError>>();
        let cancel = CancellationToken::new();

        let handle = spawn_with_rendezvous(Duration::from_secs(5), {
            let cancel = cancel.clone();
            let listener: Arc<dyn MessageListener> = listener.clone();
            move |ready| {
                pull_loop(
                    target(listener),
                    false,
                    MessagingMetrics::new(),
                    cancel,
                    ready,
                    tokio_stream_from(messages),
                )
            }
        })
        .await
        .unwrap();

        tx.send(inbound("one")).ok().unwrap();
        assert_eq!(rx.recv().await.unwrap(), "one");

        cancel.cancel();
        handle.await.unwrap();

        let _ = tx.send(inbound("two"));
        assert_eq!(listener.seen(), vec!["one"]);
    }

    #[tokio::test]
    async fn test_rendezvous_reports_loop_that_exits_early() {
        let result = spawn_with_rendezvous(Duration::from_secs(5), |ready| async move {
            drop(ready);
        })
        .await;
        assert!(matches!(result, Err(MessagingError::ConsumerError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendezvous_times_out() {
        let result = spawn_with_rendezvous(Duration::from_millis(50), |ready| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(ready);
        })
        .await;
        assert!(matches!(result, Err(MessagingError::ConsumerError(_))));
    }

    #[tokio::test]
    async fn test_fan_out_keeps_other_listener_after_detach() {
        let registry = Arc::new(SubscriptionRegistry::<()>::default());
        let (first, _first_rx) = RecordingListener::new();
        let (second, mut second_rx) = RecordingListener::new();

        for (name, listener) in [("l1", first.clone()), ("l2", second.clone())] {
            registry
                .add(Subscription::new(
                    SubscriptionKey::new("orders", "", name),
                    (),
                    listener,
                    CancellationToken::new(),
                ))
                .ok()
                .unwrap();
        }

        let (tx, messages) = mpsc::unbounded_channel::<Result<Inbound, MessagingError>>();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fan_out_loop(
            registry.clone(),
            |key: &SubscriptionKey, inbound: &Inbound| key.topic == inbound.topic,
            MessagingMetrics::new(),
            cancel.clone(),
            None,
            tokio_stream_from(messages),
        ));

        tx.send(inbound("before")).ok().unwrap();
        assert_eq!(second_rx.recv().await.unwrap(), "before");

        assert!(matches!(
            registry.detach(&SubscriptionKey::new("orders", "", "l1")),
            Detached::Shared(_)
        ));

        tx.send(inbound("after")).ok().unwrap();
        assert_eq!(second_rx.recv().await.unwrap(), "after");

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(first.seen(), vec!["before"]);
        assert_eq!(second.seen(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_skipped_target_is_not_invoked() {
        let (listener, _rx) = RecordingListener::new();
        let target = target(listener.clone());
        target.skip.skip();

        let metrics = MessagingMetrics::new();
        deliver(&target, true, &metrics, inbound("x").unwrap()).await;
        assert!(listener.seen().is_empty());
        assert_eq!(metrics.snapshot().received, 0);
    }

    #[tokio::test]
    async fn test_skipped_target_requeues_delivery() {
        let broker = MemoryBroker::new();
        broker.publish("orders", &MessageEnvelope::new("Created", None, "order-1"));
        let envelope = broker.try_take("orders").unwrap();
        assert_eq!(broker.in_flight("orders"), 1);

        let (listener, _rx) = RecordingListener::new();
        let target = target(listener.clone());
        target.skip.skip();

        deliver(
            &target,
            true,
            &MessagingMetrics::new(),
            Inbound::new("orders", envelope),
        )
        .await;

        assert!(listener.seen().is_empty());
        assert_eq!(broker.in_flight("orders"), 0);
        assert_eq!(broker.pending("orders"), 1);
    }

    #[tokio::test]
    async fn test_pull_loop_counts_deliveries_and_failures() {
        let (listener, _rx) = RecordingListener::new();
        let (ready_tx, _ready_rx) = oneshot::channel();
        let metrics = MessagingMetrics::new();
        let messages = stream::iter(vec![
            inbound("first"),
            inbound("fail"),
            Err(MessagingError::ParsePayloadError("garbage".into())),
            inbound("panic"),
        ]);

        pull_loop(
            target(listener),
            false,
            metrics.clone(),
            CancellationToken::new(),
            ready_tx,
            messages,
        )
        .await;

        let counted = metrics.snapshot();
        assert_eq!(counted.received, 3);
        assert_eq!(counted.failed, 3);
    }

    #[tokio::test]
    async fn test_fan_out_counts_undecodable_messages() {
        let registry = Arc::new(SubscriptionRegistry::<()>::default());
        let (listener, _rx) = RecordingListener::new();
        registry
            .add(Subscription::new(
                SubscriptionKey::new("orders", "", "l1"),
                (),
                listener.clone(),
                CancellationToken::new(),
            ))
            .ok()
            .unwrap();

        let metrics = MessagingMetrics::new();
        let messages = stream::iter(vec![
            Err(MessagingError::ParsePayloadError("garbage".into())),
            inbound("order-1"),
        ]);
        fan_out_loop(
            registry,
            |key: &SubscriptionKey, inbound: &Inbound| key.topic == inbound.topic,
            metrics.clone(),
            CancellationToken::new(),
            None,
            messages,
        )
        .await;

        assert_eq!(listener.seen(), vec!["order-1"]);
        let counted = metrics.snapshot();
        assert_eq!(counted.received, 1);
        assert_eq!(counted.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_receive_times_out_with_none() {
        let started = Instant::now();
        let mut attempts = 0;
        let result = poll_receive(Duration::from_millis(200), Duration::from_millis(50), || {
            attempts += 1;
            async { Ok(None) }
        })
        .await;

        assert_eq!(result.unwrap().map(|e| e.message_id), None);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_receive_returns_first_message() {
        let mut attempts = 0;
        let result = poll_receive(Duration::from_secs(5), Duration::from_millis(100), || {
            attempts += 1;
            let ready = attempts == 3;
            async move {
                Ok(ready.then(|| MessageEnvelope::new("Created", None, "order-1")))
            }
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap().message, b"order-1");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_poll_receive_propagates_errors() {
        let result = poll_receive(Duration::from_secs(1), Duration::from_millis(10), || async {
            Err(MessagingError::not_opened("connection"))
        })
        .await;
        assert!(matches!(result, Err(MessagingError::InvalidState(_))));
    }

    pub(crate) fn tokio_stream_from<T>(
        mut rx: mpsc::UnboundedReceiver<T>,
    ) -> impl Stream<Item = T> {
        stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}
