// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Connections
//!
//! This module provides the error type shared by every broker adapter. The
//! `MessagingError` enum covers configuration, connection lifecycle, delivery and
//! administration failures. Native driver errors are logged where they happen and
//! carried here as text, so the enum stays comparable in tests.

use thiserror::Error;

/// Represents errors that can occur while talking to a message broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Required connection or queue settings are missing or contradictory
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// The native client could not reach the broker
    #[error("failure to connect to `{uri}`: {reason}")]
    ConnectionError { uri: String, reason: String },

    /// A data-plane operation was attempted while the connection is not open
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A subscription with the same (topic, group, listener) key already exists
    #[error("subscription `{0}` is already registered")]
    DuplicateSubscription(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error creating or running a consumer
    #[error("failure to consume: {0}")]
    ConsumerError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue or topic with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting or purging a queue or topic with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error parsing a message payload or its metadata
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error talking to the administrative client
    #[error("administrative operation failed: {0}")]
    AdminError(String),
}

impl MessagingError {
    pub(crate) fn not_opened(what: &str) -> Self {
        MessagingError::InvalidState(format!("{} is not opened", what))
    }
}
