// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The broker-neutral representation of a message: payload bytes plus
//! correlation metadata, and an opaque reference back to the native delivery
//! unit that is used to acknowledge it.

use crate::errors::MessagingError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Header names carrying envelope metadata on brokers with message headers.
pub const HEADER_MESSAGE_ID: &str = "message_id";
pub const HEADER_MESSAGE_TYPE: &str = "message_type";
pub const HEADER_TRACE_ID: &str = "trace_id";
pub const HEADER_SENT_TIME: &str = "sent_time";

/// Broker-neutral message with correlation metadata.
///
/// The `reference` is never serialized: it only lives as long as the envelope
/// that was handed out by a receive or dispatch, and is cleared by the first
/// terminal operation (`complete`, `abandon`, `move_to_dead_letter`).
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub message: Vec<u8>,
    pub sent_time: DateTime<Utc>,
    #[serde(skip)]
    reference: Option<MessageReference>,
}

impl MessageEnvelope {
    pub fn new(message_type: &str, trace_id: Option<&str>, message: impl Into<Vec<u8>>) -> Self {
        MessageEnvelope {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.to_owned(),
            trace_id: trace_id.map(str::to_owned),
            message: message.into(),
            sent_time: Utc::now(),
            reference: None,
        }
    }

    /// Creates an envelope whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(
        message_type: &str,
        trace_id: Option<&str>,
        value: &T,
    ) -> Result<Self, MessagingError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| MessagingError::ParsePayloadError(err.to_string()))?;
        Ok(Self::new(message_type, trace_id, payload))
    }

    pub fn message_as_string(&self) -> Result<String, MessagingError> {
        String::from_utf8(self.message.clone())
            .map_err(|err| MessagingError::ParsePayloadError(err.to_string()))
    }

    pub fn message_as_json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.message)
            .map_err(|err| MessagingError::ParsePayloadError(err.to_string()))
    }

    pub fn reference(&self) -> Option<&MessageReference> {
        self.reference.as_ref()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub(crate) fn set_reference(&mut self, reference: MessageReference) {
        self.reference = Some(reference);
    }

    pub(crate) fn with_reference(mut self, reference: MessageReference) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Removes the reference so it can be resolved exactly once.
    pub(crate) fn take_reference(&mut self) -> Option<MessageReference> {
        self.reference.take()
    }

    /// Copies the metadata and payload. The copy never carries a reference.
    pub(crate) fn detached_copy(&self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.message_id.clone(),
            message_type: self.message_type.clone(),
            trace_id: self.trace_id.clone(),
            message: self.message.clone(),
            sent_time: self.sent_time,
            reference: None,
        }
    }

    /// JSON form used by brokers that have no message properties (MQTT).
    pub(crate) fn to_json_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|err| MessagingError::ParsePayloadError(err.to_string()))
    }

    pub(crate) fn from_json_bytes(bytes: &[u8]) -> Result<MessageEnvelope, MessagingError> {
        serde_json::from_slice(bytes)
            .map_err(|err| MessagingError::ParsePayloadError(err.to_string()))
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{}]",
            self.trace_id.as_deref().unwrap_or("---"),
            self.message_type,
            self.message_id
        )
    }
}

/// Opaque handle to the native delivery unit of a received message.
pub struct MessageReference {
    pub(crate) kind: ReferenceKind,
}

pub(crate) enum ReferenceKind {
    Amqp(lapin::acker::Acker),
    #[cfg(feature = "kafka")]
    Kafka(crate::kafka::message::KafkaCursor),
    Memory(crate::memory::broker::MemoryDelivery),
}

impl MessageReference {
    pub(crate) fn new(kind: ReferenceKind) -> Self {
        MessageReference { kind }
    }

    /// Settles the delivery as processed.
    pub(crate) async fn complete(self) -> Result<(), MessagingError> {
        match self.kind {
            ReferenceKind::Amqp(acker) => crate::rabbitmq::consumer::ack(&acker).await,
            #[cfg(feature = "kafka")]
            ReferenceKind::Kafka(cursor) => cursor.commit(),
            ReferenceKind::Memory(delivery) => delivery.ack(),
        }
    }

    /// Releases the delivery so the broker can hand it out again, when the
    /// broker supports it.
    pub(crate) async fn abandon(self) -> Result<(), MessagingError> {
        match self.kind {
            ReferenceKind::Amqp(acker) => crate::rabbitmq::consumer::requeue(&acker).await,
            // uncommitted offsets are redelivered after a rebalance or restart
            #[cfg(feature = "kafka")]
            ReferenceKind::Kafka(_) => Ok(()),
            ReferenceKind::Memory(delivery) => delivery.requeue(),
        }
    }
}

impl fmt::Debug for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ReferenceKind::Amqp(_) => "amqp",
            #[cfg(feature = "kafka")]
            ReferenceKind::Kafka(_) => "kafka",
            ReferenceKind::Memory(_) => "memory",
        };
        f.debug_struct("MessageReference").field("kind", &kind).finish()
    }
}
