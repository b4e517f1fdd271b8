// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ
//!
//! AMQP 0.9.1 adapter built on `lapin`.
//!
//! | Verb | Effect |
//! |------|--------|
//! | send | `basic_publish`, persistent when `options.persistent` is set |
//! | peek | `basic_get` followed by a requeueing nack |
//! | receive | `basic_get` polled every `options.receive_interval` |
//! | complete / abandon | ack / nack with requeue |
//! | clear | `queue_purge` |
//! | renew_lock / move_to_dead_letter | not supported |

pub mod channel;
pub mod connection;
pub(crate) mod consumer;
pub mod exchange;
mod otel;
pub(crate) mod publisher;
pub mod queue;
pub mod settings;
pub mod topology;

pub use connection::RabbitMqConnection;
pub use queue::RabbitMqMessageQueue;
pub use settings::RabbitMqSettings;
