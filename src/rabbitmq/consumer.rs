// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Converts AMQP deliveries into envelopes and settles them through their acker.

use crate::{
    envelope::{MessageEnvelope, MessageReference, ReferenceKind},
    errors::MessagingError,
    rabbitmq::otel,
};
use chrono::{DateTime, Utc};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
};
use opentelemetry::Context;
use tracing::error;
use uuid::Uuid;

/// Turns a delivery into an envelope holding its acker, together with the
/// producer's trace context.
///
/// A message without a trace id falls back to the trace of the extracted
/// context; one without a message id gets a fresh id.
pub(crate) fn envelope_from_delivery(delivery: Delivery) -> (Context, MessageEnvelope) {
    let ctx = otel::extract(&delivery.properties);
    let mut envelope = envelope_from_properties(&delivery.properties, delivery.data);

    if envelope.trace_id.is_none() {
        envelope.trace_id = otel::trace_id(&ctx);
    }

    let reference = MessageReference::new(ReferenceKind::Amqp(delivery.acker));
    (ctx, envelope.with_reference(reference))
}

fn envelope_from_properties(props: &AMQPProperties, data: Vec<u8>) -> MessageEnvelope {
    let message_type = match props.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    };
    let trace_id = props.correlation_id().as_ref().map(|v| v.to_string());

    let mut envelope = MessageEnvelope::new(&message_type, trace_id.as_deref(), data);
    envelope.message_id = match props.message_id() {
        Some(value) => value.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    envelope.sent_time = (*props.timestamp())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
        .unwrap_or_else(Utc::now);

    envelope
}

pub(crate) async fn ack(acker: &Acker) -> Result<(), MessagingError> {
    match acker.ack(BasicAckOptions { multiple: false }).await {
        Err(err) => {
            error!(error = err.to_string(), "error to ack msg");
            Err(MessagingError::AckMessageError(err.to_string()))
        }
        _ => Ok(()),
    }
}

pub(crate) async fn requeue(acker: &Acker) -> Result<(), MessagingError> {
    match acker
        .nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to nack msg");
            Err(MessagingError::NackMessageError(err.to_string()))
        }
        _ => Ok(()),
    }
}
