// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Kafka Message Mapping
//!
//! Envelope metadata travels in Kafka record headers; the payload is the record
//! value and the message id is the record key. A received envelope carries a
//! [`KafkaCursor`] when its offset has to be committed by hand.

use crate::{
    envelope::{
        MessageEnvelope, HEADER_MESSAGE_ID, HEADER_MESSAGE_TYPE, HEADER_SENT_TIME,
        HEADER_TRACE_ID,
    },
    errors::MessagingError,
};
use chrono::{DateTime, Utc};
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Headers, OwnedHeaders},
    Message, Offset, TopicPartitionList,
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

pub(crate) fn headers_for(envelope: &MessageEnvelope) -> OwnedHeaders {
    let sent_time = envelope.sent_time.timestamp_millis().to_string();
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: HEADER_MESSAGE_ID,
            value: Some(envelope.message_id.as_bytes()),
        })
        .insert(Header {
            key: HEADER_MESSAGE_TYPE,
            value: Some(envelope.message_type.as_bytes()),
        })
        .insert(Header {
            key: HEADER_SENT_TIME,
            value: Some(sent_time.as_bytes()),
        });

    if let Some(trace_id) = &envelope.trace_id {
        headers = headers.insert(Header {
            key: HEADER_TRACE_ID,
            value: Some(trace_id.as_bytes()),
        });
    }
    headers
}

fn header<M: Message>(message: &M, key: &str) -> Option<String> {
    let headers = message.headers()?;
    headers
        .iter()
        .find(|h| h.key == key)
        .and_then(|h| h.value)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

/// Builds an envelope from a record. Records written by other producers get a
/// generated id and their broker timestamp.
pub(crate) fn envelope_from_message<M: Message>(message: &M) -> MessageEnvelope {
    let message_type = header(message, HEADER_MESSAGE_TYPE).unwrap_or_default();
    let trace_id = header(message, HEADER_TRACE_ID);
    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

    let mut envelope = MessageEnvelope::new(&message_type, trace_id.as_deref(), payload);
    envelope.message_id = header(message, HEADER_MESSAGE_ID)
        .or_else(|| {
            message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let millis = header(message, HEADER_SENT_TIME)
        .and_then(|v| v.parse::<i64>().ok())
        .or_else(|| message.timestamp().to_millis());
    envelope.sent_time = millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    envelope
}

/// Position of a received record, committed through the consumer that read it.
pub(crate) struct KafkaCursor {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaCursor {
    pub fn new<M: Message>(consumer: Arc<StreamConsumer>, message: &M) -> Self {
        KafkaCursor {
            consumer,
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }

    /// Commits the offset after this record, so the group resumes past it.
    pub fn commit(self) -> Result<(), MessagingError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|err| MessagingError::AckMessageError(err.to_string()))?;

        match self.consumer.commit(&offsets, CommitMode::Async) {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    topic = self.topic,
                    partition = self.partition,
                    offset = self.offset,
                    "error to commit offset"
                );
                Err(MessagingError::AckMessageError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rdkafka::{message::OwnedMessage, ClientConfig, Timestamp};

    fn record(headers: Option<OwnedHeaders>, key: Option<&str>) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"order-1".to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "orders".to_owned(),
            Timestamp::CreateTime(1_700_000_000_000),
            0,
            42,
            headers,
        )
    }

    /// A cursor over record 42 of `orders`. The consumer never reaches a broker.
    pub(crate) fn cursor() -> KafkaCursor {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", "127.0.0.1:1")
            .set("group.id", "billing")
            .set("enable.auto.commit", "false")
            .create()
            .unwrap();
        KafkaCursor::new(Arc::new(consumer), &record(None, None))
    }

    #[test]
    fn test_headers_carry_envelope_metadata() {
        let mut sent = MessageEnvelope::new("Created", Some("trace-1"), "order-1");
        sent.message_id = "m-1".into();

        let received = envelope_from_message(&record(Some(headers_for(&sent)), None));

        assert_eq!(received.message_id, "m-1");
        assert_eq!(received.message_type, "Created");
        assert_eq!(received.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(received.message, b"order-1");
        assert_eq!(
            received.sent_time.timestamp_millis(),
            sent.sent_time.timestamp_millis()
        );
        assert!(!received.has_reference());
    }

    #[test]
    fn test_foreign_record_uses_key_and_broker_timestamp() {
        let received = envelope_from_message(&record(None, Some("k-7")));

        assert_eq!(received.message_id, "k-7");
        assert_eq!(received.message_type, "");
        assert_eq!(received.trace_id, None);
        assert_eq!(received.sent_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_record_without_key_gets_generated_id() {
        let received = envelope_from_message(&record(None, None));
        assert!(Uuid::parse_str(&received.message_id).is_ok());
    }

    #[tokio::test]
    async fn test_cursor_points_at_received_record() {
        let cursor = cursor();
        assert_eq!(cursor.topic, "orders");
        assert_eq!(cursor.partition, 0);
        assert_eq!(cursor.offset, 42);
    }
}
