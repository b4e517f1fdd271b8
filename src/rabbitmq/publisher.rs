// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Maps an envelope onto AMQP message properties and publishes it, propagating
//! the OpenTelemetry context in the message headers.

use crate::{envelope::MessageEnvelope, errors::MessagingError, rabbitmq::otel};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use tracing::{debug, error};

/// Default content type of published payloads.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// AMQP delivery mode of messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Message id, type, trace id (as correlation id), send time and trace headers.
pub(crate) fn properties_for(
    ctx: &Context,
    envelope: &MessageEnvelope,
    persistent: bool,
) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_type(ShortString::from(envelope.message_type.clone()))
        .with_timestamp(envelope.sent_time.timestamp().max(0) as u64)
        .with_headers(FieldTable::from(otel::inject(ctx)));

    if let Some(trace_id) = &envelope.trace_id {
        properties = properties.with_correlation_id(ShortString::from(trace_id.clone()));
    }
    if persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    properties
}

pub(crate) async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    properties: BasicProperties,
    envelope: &MessageEnvelope,
) -> Result<(), MessagingError> {
    match channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &envelope.message,
            properties,
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange = exchange,
                routing_key = routing_key,
                "error publishing message"
            );
            Err(MessagingError::PublishingError(err.to_string()))
        }
        _ => {
            debug!(
                exchange = exchange,
                routing_key = routing_key,
                message = %envelope,
                "message published"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_carry_envelope_metadata() {
        let envelope = MessageEnvelope::new("Created", Some("trace-1"), "order-1");
        let properties = properties_for(&Context::new(), &envelope, true);

        assert_eq!(
            properties.message_id().as_ref().map(|v| v.to_string()),
            Some(envelope.message_id.clone())
        );
        assert_eq!(
            properties.kind().as_ref().map(|v| v.to_string()).as_deref(),
            Some("Created")
        );
        assert_eq!(
            properties
                .correlation_id()
                .as_ref()
                .map(|v| v.to_string())
                .as_deref(),
            Some("trace-1")
        );
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            *properties.timestamp(),
            Some(envelope.sent_time.timestamp() as u64)
        );
    }

    #[test]
    fn test_transient_message_without_trace() {
        let envelope = MessageEnvelope::new("Created", None, "order-1");
        let properties = properties_for(&Context::new(), &envelope, false);

        assert!(properties.correlation_id().is_none());
        assert!(properties.delivery_mode().is_none());
    }
}
