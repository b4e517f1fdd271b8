// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchange kinds accepted in `options.exchange_type` and the builder used to
//! declare an exchange when the topology is installed.

use crate::errors::MessagingError;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::{collections::BTreeMap, str::FromStr};

/// Header naming the routing behaviour of a delayed-message exchange.
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Routing behaviour of an exchange.
///
/// `XMessageDelayed` needs the delayed message exchange plugin on the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl FromStr for ExchangeKind {
    type Err = MessagingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            "x-delayed-message" => Ok(ExchangeKind::XMessageDelayed),
            other => Err(MessagingError::ConfigError(format!(
                "unsupported exchange type: {}",
                other
            ))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Exchange to declare, built with chained setters.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
            durable: false,
            delete: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the kind. A delayed-message exchange routes like a direct one.
    pub fn kind(mut self, kind: &ExchangeKind) -> Self {
        self.kind = kind.clone();
        if self.kind == ExchangeKind::XMessageDelayed {
            self.params.insert(
                ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                AMQPValue::LongString(LongString::from("direct")),
            );
        }
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Deletes the exchange once no queue is bound to it.
    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exchange_kind() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!(
            " x-delayed-message ".parse::<ExchangeKind>().unwrap(),
            ExchangeKind::XMessageDelayed
        );
        assert!("broadcast".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn test_delayed_exchange_gets_routing_param() {
        let def = ExchangeDefinition::new("orders").kind(&ExchangeKind::XMessageDelayed);
        assert!(def
            .params
            .contains_key(&ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)));
        assert!(matches!(
            lapin::ExchangeKind::from(&def.kind),
            lapin::ExchangeKind::Custom(name) if name == "x-delayed-message"
        ));
    }
}
