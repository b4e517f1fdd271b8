// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Kafka
//!
//! Consumer-group adapter built on `rdkafka`.
//!
//! | Verb | Effect |
//! |------|--------|
//! | send | produce with envelope metadata in the record headers |
//! | receive | next record of the queue's group, bounded by the wait |
//! | complete | commit `offset + 1` when `options.autocommit` is off |
//! | peek / abandon / clear / renew_lock / move_to_dead_letter | not supported |

pub mod connection;
pub(crate) mod message;
pub mod queue;
pub mod settings;

pub use connection::KafkaConnection;
pub use queue::KafkaMessageQueue;
pub use settings::{KafkaOptions, KafkaSettings};
