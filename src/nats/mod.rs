// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # NATS
//!
//! Push-only adapter built on `async-nats`. A queue's `group` maps to a NATS
//! queue group: each message on the subject reaches one member of the group,
//! while listeners without a group all receive it.
//!
//! | verb                 | behavior                             |
//! |----------------------|--------------------------------------|
//! | `send`               | publish with envelope headers        |
//! | `listen`             | subscribe or queue-subscribe         |
//! | `receive` / `peek`   | unsupported, nothing to pull         |
//! | settlement verbs     | unsupported, core NATS has no acks   |

pub mod connection;
pub(crate) mod message;
pub mod queue;
pub mod settings;

pub use connection::NatsConnection;
pub use queue::NatsMessageQueue;
pub use settings::{NatsConfig, NatsSettings};
