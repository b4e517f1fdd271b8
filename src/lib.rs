// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker-neutral messaging over RabbitMQ, Kafka, MQTT and NATS, plus an
//! in-process broker.
//!
//! Each broker has a connection manager that owns the native client and the
//! subscriptions multiplexed over it, and a [`MessageQueue`] adapter exposing
//! the shared verb set. Which verbs have a real effect on a broker is reported
//! by [`MessageQueue::capabilities`].

mod dispatcher;

pub mod config;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod rabbitmq;
pub mod registry;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "nats")]
pub mod nats;

pub use config::{CommonOptions, ConnectionOptions, ConnectionResolver};
pub use connection::ConnectionState;
pub use envelope::{MessageEnvelope, MessageReference};
pub use errors::MessagingError;
pub use queue::{
    Capabilities, MessageListener, MessageQueue, MessageQueueConnection, MessageReceiver,
};
