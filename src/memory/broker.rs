// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker: named topics holding ready and in-flight messages.

use crate::{
    envelope::{MessageEnvelope, MessageReference, ReferenceKind},
    errors::MessagingError,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct Topic {
    ready: VecDeque<(u64, MessageEnvelope)>,
    in_flight: HashMap<u64, MessageEnvelope>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Topic>,
    next_id: u64,
}

/// Cheap-clone handle to a shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes new connections fail, as an unreachable broker would.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, topic: &str, envelope: &MessageEnvelope) {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;

        let topic_state = state.topics.entry(topic.to_owned()).or_default();
        topic_state.ready.push_back((id, envelope.detached_copy()));
        topic_state.notify.notify_one();
    }

    /// Moves the next ready message in flight and returns it with a reference.
    pub(crate) fn try_take(&self, topic: &str) -> Option<MessageEnvelope> {
        let mut state = self.lock();
        let topic_state = state.topics.get_mut(topic)?;
        let (id, envelope) = topic_state.ready.pop_front()?;
        topic_state.in_flight.insert(id, envelope.detached_copy());

        let delivery = MemoryDelivery {
            broker: self.clone(),
            topic: topic.to_owned(),
            id,
        };
        Some(envelope.with_reference(MessageReference::new(ReferenceKind::Memory(delivery))))
    }

    /// Waits for the next ready message of the topic.
    pub(crate) async fn take(&self, topic: &str) -> MessageEnvelope {
        loop {
            let notify = {
                let mut state = self.lock();
                state.topics.entry(topic.to_owned()).or_default().notify.clone()
            };
            if let Some(envelope) = self.try_take(topic) {
                return envelope;
            }
            notify.notified().await;
        }
    }

    pub(crate) fn peek(&self, topic: &str, max: usize) -> Vec<MessageEnvelope> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| {
                t.ready
                    .iter()
                    .take(max)
                    .map(|(_, e)| e.detached_copy())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, |t| t.ready.len())
    }

    pub fn in_flight(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, |t| t.in_flight.len())
    }

    pub(crate) fn purge(&self, topic: &str) -> usize {
        let mut state = self.lock();
        match state.topics.get_mut(topic) {
            Some(t) => {
                let purged = t.ready.len();
                t.ready.clear();
                purged
            }
            None => 0,
        }
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.lock().topics.keys().cloned().collect()
    }

    pub(crate) fn create_topic(&self, topic: &str) {
        self.lock().topics.entry(topic.to_owned()).or_default();
    }

    pub(crate) fn delete_topic(&self, topic: &str) -> bool {
        let removed = self.lock().topics.remove(topic);
        match removed {
            Some(t) => {
                // wake waiters so they re-register on a fresh topic
                t.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    fn settle(&self, topic: &str, id: u64, requeue: bool) {
        let mut state = self.lock();
        let Some(topic_state) = state.topics.get_mut(topic) else {
            debug!(topic = topic, "topic removed before settlement");
            return;
        };
        let Some(envelope) = topic_state.in_flight.remove(&id) else {
            return;
        };
        if requeue {
            topic_state.ready.push_front((id, envelope));
            topic_state.notify.notify_one();
        }
    }
}

/// Delivery handle of a message taken from a [`MemoryBroker`] topic.
pub(crate) struct MemoryDelivery {
    broker: MemoryBroker,
    topic: String,
    id: u64,
}

impl MemoryDelivery {
    pub fn ack(self) -> Result<(), MessagingError> {
        self.broker.settle(&self.topic, self.id, false);
        Ok(())
    }

    pub fn requeue(self) -> Result<(), MessagingError> {
        self.broker.settle(&self.topic, self.id, true);
        Ok(())
    }
}
