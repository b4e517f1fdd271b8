// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Queue-level RabbitMQ settings read from [`ConnectionOptions`].

use crate::{
    config::{ConnectionOptions, OPTIONS_AUTO_CREATE},
    errors::MessagingError,
    rabbitmq::exchange::ExchangeKind,
};

pub const QUEUE: &str = "queue";
pub const EXCHANGE: &str = "exchange";
pub const ROUTING_KEY: &str = "routing_key";
pub const OPTIONS_EXCHANGE_TYPE: &str = "options.exchange_type";
pub const OPTIONS_PERSISTENT: &str = "options.persistent";
pub const OPTIONS_DURABLE: &str = "options.durable";
pub const OPTIONS_AUTO_DELETE: &str = "options.auto_delete";
pub const OPTIONS_VHOST: &str = "options.vhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: String,
    pub exchange_kind: ExchangeKind,
    pub auto_create: bool,
    pub persistent: bool,
    pub durable: bool,
    pub auto_delete: bool,
}

impl RabbitMqSettings {
    /// Reads the settings. At least one of `queue` and `exchange` must be set.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        let queue = options.get(QUEUE).map(str::to_owned);
        let exchange = options.get(EXCHANGE).map(str::to_owned);

        if queue.is_none() && exchange.is_none() {
            return Err(MessagingError::ConfigError(format!(
                "either `{}` or `{}` must be set",
                QUEUE, EXCHANGE
            )));
        }

        let exchange_kind = match options.get(OPTIONS_EXCHANGE_TYPE) {
            Some(kind) => kind.parse()?,
            None => ExchangeKind::default(),
        };

        Ok(RabbitMqSettings {
            queue,
            exchange,
            routing_key: options.get_or(ROUTING_KEY, "").to_owned(),
            exchange_kind,
            auto_create: options.get_as_bool_or(OPTIONS_AUTO_CREATE, false)?,
            persistent: options.get_as_bool_or(OPTIONS_PERSISTENT, false)?,
            durable: options.get_as_bool_or(OPTIONS_DURABLE, true)?,
            auto_delete: options.get_as_bool_or(OPTIONS_AUTO_DELETE, false)?,
        })
    }

    /// Name the queue adapter reports: the queue, or the exchange when the
    /// adapter only publishes.
    pub fn name(&self) -> &str {
        self.queue
            .as_deref()
            .or(self.exchange.as_deref())
            .unwrap_or_default()
    }

    /// Queue to consume from; consuming verbs cannot run without one.
    pub fn require_queue(&self) -> Result<&str, MessagingError> {
        self.queue.as_deref().ok_or_else(|| {
            MessagingError::ConfigError(format!("`{}` must be set to consume messages", QUEUE))
        })
    }

    /// Exchange and routing key a message is published with. Without an exchange
    /// the default exchange routes straight to the queue.
    pub fn publish_target(&self) -> (&str, &str) {
        match (&self.exchange, &self.queue) {
            (Some(exchange), _) => (exchange.as_str(), self.routing_key.as_str()),
            (None, Some(queue)) => ("", queue.as_str()),
            (None, None) => ("", self.routing_key.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_or_exchange_is_required() {
        let err = RabbitMqSettings::from_options(&ConnectionOptions::new()).unwrap_err();
        assert!(matches!(err, MessagingError::ConfigError(_)));
    }

    #[test]
    fn test_defaults() {
        let settings =
            RabbitMqSettings::from_options(&ConnectionOptions::from_tuples(&[(QUEUE, "jobs")]))
                .unwrap();

        assert_eq!(settings.name(), "jobs");
        assert_eq!(settings.exchange_kind, ExchangeKind::Fanout);
        assert!(settings.durable);
        assert!(!settings.auto_create);
        assert!(!settings.persistent);
        assert_eq!(settings.publish_target(), ("", "jobs"));
    }

    #[test]
    fn test_exchange_only_can_publish_but_not_consume() {
        let settings = RabbitMqSettings::from_options(&ConnectionOptions::from_tuples(&[
            (EXCHANGE, "orders"),
            (ROUTING_KEY, "eu"),
            (OPTIONS_EXCHANGE_TYPE, "topic"),
        ]))
        .unwrap();

        assert_eq!(settings.name(), "orders");
        assert_eq!(settings.exchange_kind, ExchangeKind::Topic);
        assert_eq!(settings.publish_target(), ("orders", "eu"));
        assert!(matches!(
            settings.require_queue(),
            Err(MessagingError::ConfigError(_))
        ));
    }

    #[test]
    fn test_unknown_exchange_type_is_rejected() {
        let options = ConnectionOptions::from_tuples(&[
            (EXCHANGE, "orders"),
            (OPTIONS_EXCHANGE_TYPE, "broadcast"),
        ]);
        assert!(matches!(
            RabbitMqSettings::from_options(&options),
            Err(MessagingError::ConfigError(_))
        ));
    }
}
