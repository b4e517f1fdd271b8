// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Envelope metadata travels in NATS message headers next to the raw payload.

use crate::envelope::{
    MessageEnvelope, HEADER_MESSAGE_ID, HEADER_MESSAGE_TYPE, HEADER_SENT_TIME, HEADER_TRACE_ID,
};
use async_nats::HeaderMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub(crate) fn headers_for(envelope: &MessageEnvelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_MESSAGE_ID, envelope.message_id.as_str());
    headers.insert(HEADER_MESSAGE_TYPE, envelope.message_type.as_str());
    headers.insert(
        HEADER_SENT_TIME,
        envelope.sent_time.timestamp_millis().to_string().as_str(),
    );
    if let Some(trace_id) = &envelope.trace_id {
        headers.insert(HEADER_TRACE_ID, trace_id.as_str());
    }
    headers
}

fn header(headers: Option<&HeaderMap>, key: &str) -> Option<String> {
    headers?
        .get(key)
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Messages published without headers get a generated id and the receive time.
pub(crate) fn envelope_from_parts(headers: Option<&HeaderMap>, payload: &[u8]) -> MessageEnvelope {
    let message_type = header(headers, HEADER_MESSAGE_TYPE).unwrap_or_default();
    let trace_id = header(headers, HEADER_TRACE_ID);

    let mut envelope = MessageEnvelope::new(&message_type, trace_id.as_deref(), payload.to_vec());
    envelope.message_id =
        header(headers, HEADER_MESSAGE_ID).unwrap_or_else(|| Uuid::new_v4().to_string());
    envelope.sent_time = header(headers, HEADER_SENT_TIME)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_carry_envelope_metadata() {
        let mut sent = MessageEnvelope::new("Created", Some("trace-1"), "order-1");
        sent.message_id = "m-1".into();

        let headers = headers_for(&sent);
        let received = envelope_from_parts(Some(&headers), b"order-1");

        assert_eq!(received.message_id, "m-1");
        assert_eq!(received.message_type, "Created");
        assert_eq!(received.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(received.message, b"order-1");
        assert_eq!(
            received.sent_time.timestamp_millis(),
            sent.sent_time.timestamp_millis()
        );
    }

    #[test]
    fn test_message_without_headers() {
        let received = envelope_from_parts(None, b"hello");

        assert!(Uuid::parse_str(&received.message_id).is_ok());
        assert_eq!(received.message_type, "");
        assert_eq!(received.trace_id, None);
        assert_eq!(received.message, b"hello");
        assert!(!received.has_reference());
    }
}
