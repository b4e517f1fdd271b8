// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker living inside the process, with the delivery semantics of a queue
//! that requires explicit acknowledgment. Useful for local runs and for testing
//! code written against [`MessageQueue`](crate::queue::MessageQueue) without a
//! running broker.

pub mod broker;
pub mod connection;
pub mod queue;

pub use broker::MemoryBroker;
pub use connection::MemoryConnection;
pub use queue::MemoryMessageQueue;
