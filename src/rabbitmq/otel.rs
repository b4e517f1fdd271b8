// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates the trace context through AMQP message headers with the global
//! text-map propagator.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::TraceContextExt,
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Trace context entries stored as long-string AMQP headers.
pub(crate) struct AmqpHeaders<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for AmqpHeaders<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_lowercase());
        self.0.insert(key, AMQPValue::LongString(value.into()));
    }
}

impl Extractor for AmqpHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let AMQPValue::LongString(value) = self.0.get(key)? else {
            return None;
        };
        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(header = key, error = err.to_string(), "trace header is not utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(ShortString::as_str).collect()
    }
}

/// Headers carrying `ctx` for an outgoing message.
pub(crate) fn inject(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::default();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut AmqpHeaders(&mut headers))
    });
    headers
}

/// Producer context carried by an incoming message, if any.
pub(crate) fn extract(props: &AMQPProperties) -> Context {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaders(&mut headers))
    })
}

/// Trace id of the span in `ctx`, when it has a valid one.
pub(crate) fn trace_id(ctx: &Context) -> Option<String> {
    let span = ctx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn test_extract_reads_long_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        headers.insert(ShortString::from("count"), AMQPValue::LongInt(3));

        let carrier = AmqpHeaders(&mut headers);
        assert_eq!(carrier.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(carrier.get("count"), None);
        assert_eq!(carrier.get("missing"), None);
        assert_eq!(carrier.keys().len(), 2);
    }

    #[test]
    fn test_inject_lowercases_keys() {
        let mut headers = BTreeMap::new();
        AmqpHeaders(&mut headers).set("TraceParent", "x".to_owned());
        assert!(headers.contains_key(&ShortString::from("traceparent")));
    }

    #[test]
    fn test_empty_context_has_no_trace_id() {
        assert_eq!(trace_id(&Context::new()), None);
    }
}
