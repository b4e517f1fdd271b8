// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Message counters recorded through the global OpenTelemetry meter. Each
//! instance also keeps its own totals, readable with [`MessagingMetrics::snapshot`].

use opentelemetry::{global, metrics::Counter, KeyValue};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

const METER_NAME: &str = "messaging";

/// Totals counted by one [`MessagingMetrics`] and its clones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Totals {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone)]
pub struct MessagingMetrics {
    sent: Counter<u64>,
    received: Counter<u64>,
    failed: Counter<u64>,
    totals: Arc<Totals>,
}

impl Default for MessagingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingMetrics {
    pub fn new() -> Self {
        let meter = global::meter(METER_NAME);
        MessagingMetrics {
            sent: meter
                .u64_counter("messaging.messages.sent")
                .with_description("messages published to the broker")
                .build(),
            received: meter
                .u64_counter("messaging.messages.received")
                .with_description("messages handed to a receiver")
                .build(),
            failed: meter
                .u64_counter("messaging.messages.failed")
                .with_description("messages that failed to decode or whose receiver failed")
                .build(),
            totals: Arc::new(Totals::default()),
        }
    }

    pub fn record_sent(&self, topic: &str) {
        self.totals.sent.fetch_add(1, Ordering::Relaxed);
        self.sent.add(1, &[KeyValue::new("topic", topic.to_owned())]);
    }

    pub fn record_received(&self, topic: &str) {
        self.totals.received.fetch_add(1, Ordering::Relaxed);
        self.received
            .add(1, &[KeyValue::new("topic", topic.to_owned())]);
    }

    pub fn record_failed(&self, topic: &str) {
        self.totals.failed.fetch_add(1, Ordering::Relaxed);
        self.failed.add(1, &[KeyValue::new("topic", topic.to_owned())]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.totals.sent.load(Ordering::Relaxed),
            received: self.totals.received.load(Ordering::Relaxed),
            failed: self.totals.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_totals() {
        let metrics = MessagingMetrics::new();
        let clone = metrics.clone();

        metrics.record_sent("orders");
        clone.record_received("orders");
        clone.record_failed("invoices");

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                sent: 1,
                received: 1,
                failed: 1,
            }
        );
        assert_eq!(MessagingMetrics::new().snapshot(), MetricsSnapshot::default());
    }
}
