// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Tracks the `(topic, group, listener)` subscriptions multiplexed over one
//! connection. All access goes through a single mutex; callers only ever get
//! snapshots or owned entries back, never a guard.

use crate::{errors::MessagingError, queue::MessageListener};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub topic: String,
    pub group: String,
    pub listener: String,
}

impl SubscriptionKey {
    pub fn new(topic: &str, group: &str, listener: &str) -> Self {
        SubscriptionKey {
            topic: topic.to_owned(),
            group: group.to_owned(),
            listener: listener.to_owned(),
        }
    }

    /// Whether both keys share the same physical broker subscription.
    pub fn same_physical(&self, other: &SubscriptionKey) -> bool {
        self.topic == other.topic && self.group == other.group
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.topic, self.group, self.listener)
    }
}

/// Logically detaches a listener from a physical subscription that stays active.
#[derive(Debug, Clone, Default)]
pub struct SkipFlag(Arc<AtomicBool>);

impl SkipFlag {
    pub fn skip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_skipped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct Subscription<H> {
    pub key: SubscriptionKey,
    pub handler: H,
    pub listener: Arc<dyn MessageListener>,
    pub skip: SkipFlag,
    pub cancel: CancellationToken,
}

impl<H> Subscription<H> {
    pub fn new(
        key: SubscriptionKey,
        handler: H,
        listener: Arc<dyn MessageListener>,
        cancel: CancellationToken,
    ) -> Self {
        Subscription {
            key,
            handler,
            listener,
            skip: SkipFlag::default(),
            cancel,
        }
    }

    /// What a dispatch loop needs to deliver to this subscription.
    pub fn target(&self) -> Target {
        Target {
            key: self.key.clone(),
            listener: self.listener.clone(),
            skip: self.skip.clone(),
        }
    }
}

/// A live listener handed to a fan-out loop.
#[derive(Clone)]
pub(crate) struct Target {
    pub key: SubscriptionKey,
    pub listener: Arc<dyn MessageListener>,
    pub skip: SkipFlag,
}

/// Result of removing a subscription that may share its physical subscription.
pub(crate) enum Detached<H> {
    NotFound,
    /// Other subscriptions still use the physical subscription; keep it.
    Shared(Subscription<H>),
    /// This was the last user; the physical subscription must be torn down.
    Last(Subscription<H>),
}

pub(crate) struct SubscriptionRegistry<H> {
    entries: Mutex<Vec<Subscription<H>>>,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        SubscriptionRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<H> SubscriptionRegistry<H> {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscription<H>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscription. A duplicate key is handed back with the error
    /// so the caller can tear down what it created.
    pub fn add(
        &self,
        subscription: Subscription<H>,
    ) -> Result<(), (MessagingError, Subscription<H>)> {
        let mut entries = self.lock();
        if entries.iter().any(|s| s.key == subscription.key) {
            let err = MessagingError::DuplicateSubscription(subscription.key.to_string());
            return Err((err, subscription));
        }
        entries.push(subscription);
        Ok(())
    }

    pub fn remove(&self, key: &SubscriptionKey) -> Option<Subscription<H>> {
        let mut entries = self.lock();
        let index = entries.iter().position(|s| &s.key == key)?;
        Some(entries.remove(index))
    }

    /// Removes the subscription and flips its skip flag, reporting whether another
    /// subscription still shares its physical subscription.
    pub fn detach(&self, key: &SubscriptionKey) -> Detached<H> {
        let mut entries = self.lock();
        let Some(index) = entries.iter().position(|s| &s.key == key) else {
            return Detached::NotFound;
        };

        let removed = entries.remove(index);
        removed.skip.skip();

        if entries.iter().any(|s| s.key.same_physical(key)) {
            Detached::Shared(removed)
        } else {
            Detached::Last(removed)
        }
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.lock().iter().any(|s| &s.key == key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.lock().iter().map(|s| s.key.clone()).collect()
    }

    /// Snapshot of the listeners whose key matches.
    pub fn targets(&self, matches: impl Fn(&SubscriptionKey) -> bool) -> Vec<Target> {
        self.lock()
            .iter()
            .filter(|s| matches(&s.key))
            .map(|s| Target {
                key: s.key.clone(),
                listener: s.listener.clone(),
                skip: s.skip.clone(),
            })
            .collect()
    }

    /// Takes every subscription out of the registry.
    pub fn drain(&self) -> Vec<Subscription<H>> {
        std::mem::take(&mut *self.lock())
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    /// Handler of any subscription sharing the physical subscription of `key`.
    pub fn handler_for(&self, key: &SubscriptionKey) -> Option<H> {
        self.lock()
            .iter()
            .find(|s| s.key.same_physical(key))
            .map(|s| s.handler.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::envelope::MessageEnvelope;
    use async_trait::async_trait;
    use opentelemetry::Context;

    pub(crate) struct NoopListener;

    #[async_trait]
    impl MessageListener for NoopListener {
        async fn on_message(
            &self,
            _ctx: &Context,
            _topic: &str,
            _envelope: &mut MessageEnvelope,
        ) -> Result<(), MessagingError> {
            Ok(())
        }
    }

    fn subscription(topic: &str, group: &str, listener: &str) -> Subscription<u32> {
        Subscription::new(
            SubscriptionKey::new(topic, group, listener),
            7,
            Arc::new(NoopListener),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_add_rejects_duplicate_key() {
        let registry = SubscriptionRegistry::default();
        registry.add(subscription("orders", "g", "l1")).ok().unwrap();

        let Err((err, rejected)) = registry.add(subscription("orders", "g", "l1")) else {
            panic!("duplicate accepted");
        };
        assert!(matches!(err, MessagingError::DuplicateSubscription(_)));
        assert_eq!(rejected.key.listener, "l1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_none() {
        let registry = SubscriptionRegistry::<u32>::default();
        assert!(registry
            .remove(&SubscriptionKey::new("orders", "", "l1"))
            .is_none());
    }

    #[test]
    fn test_detach_shared_keeps_physical() {
        let registry = SubscriptionRegistry::default();
        registry.add(subscription("orders", "", "l1")).ok().unwrap();
        registry.add(subscription("orders", "", "l2")).ok().unwrap();

        let key = SubscriptionKey::new("orders", "", "l1");
        let skip = registry.targets(|k| k == &key)[0].skip.clone();

        match registry.detach(&key) {
            Detached::Shared(removed) => assert!(removed.skip.is_skipped()),
            _ => panic!("expected shared"),
        }
        assert!(skip.is_skipped());
        assert_eq!(registry.keys(), vec![SubscriptionKey::new("orders", "", "l2")]);

        match registry.detach(&SubscriptionKey::new("orders", "", "l2")) {
            Detached::Last(_) => {}
            _ => panic!("expected last"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_groups_are_distinct_physical_subscriptions() {
        let registry = SubscriptionRegistry::default();
        registry.add(subscription("orders", "a", "l1")).ok().unwrap();
        registry.add(subscription("orders", "b", "l2")).ok().unwrap();

        assert!(matches!(
            registry.detach(&SubscriptionKey::new("orders", "a", "l1")),
            Detached::Last(_)
        ));
    }

    #[test]
    fn test_detach_unknown_key() {
        let registry = SubscriptionRegistry::<u32>::default();
        assert!(matches!(
            registry.detach(&SubscriptionKey::new("x", "", "y")),
            Detached::NotFound
        ));
    }

    #[test]
    fn test_handler_lookup_and_drain() {
        let registry = SubscriptionRegistry::default();
        registry.add(subscription("orders", "", "l1")).ok().unwrap();

        assert_eq!(
            registry.handler_for(&SubscriptionKey::new("orders", "", "other")),
            Some(7)
        );
        assert_eq!(registry.handler_for(&SubscriptionKey::new("audit", "", "l1")), None);

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }
}
