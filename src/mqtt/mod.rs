// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQTT
//!
//! Push-only adapter built on `rumqttc`. Sends publish with the configured QoS
//! and retain flag; listeners receive every message whose topic matches their
//! filter. Acknowledgment is handled by the MQTT session itself, so `complete`
//! and `abandon` have no effect.

pub mod connection;
pub mod queue;
pub mod settings;
pub mod topic;

pub use connection::MqttConnection;
pub use queue::MqttMessageQueue;
pub use settings::{MqttConfig, MqttSettings};
