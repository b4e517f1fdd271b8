// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! Exchanges, queues and bindings a queue adapter declares when
//! `options.auto_create` is set, and the single-queue declarations used by the
//! administrative operations.

use crate::{
    errors::MessagingError,
    rabbitmq::{exchange::ExchangeDefinition, settings::RabbitMqSettings},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Deletes the queue once its last consumer is gone.
    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue_name: &str, exchange_name: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue_name.to_owned(),
            exchange_name: exchange_name.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Declarations installed in order: exchanges, queues, then bindings.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// The topology behind one queue adapter: its exchange, its queue, and the
    /// binding between them when both are set.
    pub fn from_settings(settings: &RabbitMqSettings) -> AmqpTopology {
        let mut topology = AmqpTopology::new();

        if let Some(exchange) = &settings.exchange {
            topology = topology.exchange(
                ExchangeDefinition::new(exchange)
                    .kind(&settings.exchange_kind)
                    .durable(settings.durable)
                    .delete(settings.auto_delete),
            );
        }

        if let Some(queue) = &settings.queue {
            topology = topology.queue(
                QueueDefinition::new(queue)
                    .durable(settings.durable)
                    .delete(settings.auto_delete),
            );
        }

        if let (Some(exchange), Some(queue)) = (&settings.exchange, &settings.queue) {
            topology = topology.queue_binding(QueueBinding::new(
                queue,
                exchange,
                &settings.routing_key,
            ));
        }

        topology
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    /// Declares every exchange, then every queue, then binds them.
    pub async fn install(&self, channel: &Channel) -> Result<(), MessagingError> {
        for def in &self.exchanges {
            declare_exchange(channel, def).await?;
        }
        for def in &self.queues {
            declare_queue(channel, def).await?;
        }
        for binding in &self.bindings {
            bind_queue(channel, binding).await?;
        }
        Ok(())
    }
}

async fn declare_exchange(
    channel: &Channel,
    def: &ExchangeDefinition,
) -> Result<(), MessagingError> {
    let options = ExchangeDeclareOptions {
        durable: def.durable,
        auto_delete: def.delete,
        ..ExchangeDeclareOptions::default()
    };
    channel
        .exchange_declare(
            &def.name,
            lapin::ExchangeKind::from(&def.kind),
            options,
            FieldTable::from(def.params.clone()),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), exchange = def.name, "error to declare the exchange");
            MessagingError::DeclareExchangeError(def.name.clone())
        })?;

    debug!(exchange = def.name, kind = ?def.kind, "exchange declared");
    Ok(())
}

async fn bind_queue(channel: &Channel, binding: &QueueBinding) -> Result<(), MessagingError> {
    channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                queue = binding.queue_name,
                exchange = binding.exchange_name,
                "error to bind queue to exchange"
            );
            MessagingError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })?;

    debug!(
        queue = binding.queue_name,
        exchange = binding.exchange_name,
        routing_key = binding.routing_key,
        "queue bound"
    );
    Ok(())
}

pub(crate) async fn declare_queue(
    channel: &Channel,
    def: &QueueDefinition,
) -> Result<(), MessagingError> {
    let options = QueueDeclareOptions {
        durable: def.durable,
        auto_delete: def.delete,
        ..QueueDeclareOptions::default()
    };
    let declared = channel
        .queue_declare(&def.name, options, FieldTable::default())
        .await
        .map_err(|err| {
            error!(error = err.to_string(), queue = def.name, "error to declare the queue");
            MessagingError::DeclareQueueError(def.name.clone())
        })?;

    debug!(queue = def.name, messages = declared.message_count(), "queue declared");
    Ok(())
}

pub(crate) async fn delete_queue(channel: &Channel, name: &str) -> Result<(), MessagingError> {
    match channel
        .queue_delete(name, QueueDeleteOptions::default())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue = name, "error to delete the queue");
            Err(MessagingError::DeleteQueueError(name.to_owned()))
        }
        Ok(purged) => {
            debug!(queue = name, purged = purged, "queue was deleted");
            Ok(())
        }
    }
}
