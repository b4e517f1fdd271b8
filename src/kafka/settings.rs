// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Kafka client configuration and queue-level settings read from
//! [`ConnectionOptions`].

use crate::{
    config::{
        connection_uri, CommonOptions, ConnectionOptions, CREDENTIAL_PASSWORD,
        CREDENTIAL_USERNAME, GROUP, OPTIONS_AUTO_CREATE, OPTIONS_CLIENT_ID, TOPIC,
    },
    errors::MessagingError,
};
use rdkafka::ClientConfig;

pub const KAFKA_SCHEME: &str = "tcp";
pub const KAFKA_PORT: u16 = 9092;

pub const OPTIONS_AUTOCOMMIT: &str = "options.autocommit";
pub const OPTIONS_NUM_PARTITIONS: &str = "options.num_partitions";
pub const OPTIONS_REPLICATION_FACTOR: &str = "options.replication_factor";

/// Consumer group used when none is configured.
pub const DEFAULT_GROUP: &str = "messaging";

/// Connection-wide Kafka options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaOptions {
    pub brokers: String,
    pub autocommit: bool,
    pub num_partitions: i32,
    pub replication_factor: i32,
}

impl KafkaOptions {
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        let num_partitions = options.get_as_u64_or(OPTIONS_NUM_PARTITIONS, 1)?;
        let replication_factor = options.get_as_u64_or(OPTIONS_REPLICATION_FACTOR, 1)?;

        Ok(KafkaOptions {
            brokers: bootstrap_servers(options)?,
            autocommit: options.get_as_bool_or(OPTIONS_AUTOCOMMIT, true)?,
            num_partitions: positive(OPTIONS_NUM_PARTITIONS, num_partitions)?,
            replication_factor: positive(OPTIONS_REPLICATION_FACTOR, replication_factor)?,
        })
    }
}

fn positive(key: &str, value: u64) -> Result<i32, MessagingError> {
    match i32::try_from(value) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(MessagingError::ConfigError(format!(
            "`{}` must be between 1 and {}",
            key,
            i32::MAX
        ))),
    }
}

/// `host:port` list librdkafka connects to. A `connection.uri` may carry several
/// comma-separated brokers after its scheme.
pub(crate) fn bootstrap_servers(options: &ConnectionOptions) -> Result<String, MessagingError> {
    let uri = connection_uri(options, KAFKA_SCHEME, KAFKA_PORT)?;
    let hosts = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(&uri);
    let hosts = hosts.rsplit_once('@').map(|(_, rest)| rest).unwrap_or(hosts);
    Ok(hosts.trim_end_matches('/').to_owned())
}

/// Base configuration shared by the producer, the consumers and the admin client.
pub(crate) fn client_config(
    options: &ConnectionOptions,
    kafka: &KafkaOptions,
    common: &CommonOptions,
) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &kafka.brokers)
        .set(
            "socket.connection.setup.timeout.ms",
            common.connect_timeout.as_millis().to_string(),
        )
        .set(
            "reconnect.backoff.ms",
            common.reconnect_timeout.as_millis().to_string(),
        )
        .set("message.send.max.retries", common.retries.to_string());

    if let Some(client_id) = options.get(OPTIONS_CLIENT_ID) {
        config.set("client.id", client_id);
    }
    if let Some(username) = options.get(CREDENTIAL_USERNAME) {
        config
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", options.get_or(CREDENTIAL_PASSWORD, ""));
    }

    config
}

/// Configuration of a consumer in `group`.
pub(crate) fn consumer_config(base: &ClientConfig, group: &str, autocommit: bool) -> ClientConfig {
    let mut config = base.clone();
    config
        .set("group.id", group)
        .set("enable.auto.commit", autocommit.to_string())
        .set("auto.offset.reset", "earliest");
    config
}

/// Queue-level Kafka settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    pub topic: String,
    pub group: String,
    pub auto_create: bool,
}

impl KafkaSettings {
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        Ok(KafkaSettings {
            topic: options.require(TOPIC)?.to_owned(),
            group: options.get_or(GROUP, DEFAULT_GROUP).to_owned(),
            auto_create: options.get_as_bool_or(OPTIONS_AUTO_CREATE, false)?,
        })
    }
}
