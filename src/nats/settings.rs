// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    config::{
        connection_uri, CommonOptions, ConnectionOptions, CREDENTIAL_PASSWORD,
        CREDENTIAL_USERNAME, GROUP, OPTIONS_CLIENT_ID, TOPIC,
    },
    errors::MessagingError,
};
use async_nats::ConnectOptions;

pub const NATS_SCHEME: &str = "nats";
pub const NATS_PORT: u16 = 4222;

/// Server address and client identity of a NATS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    /// Server URI without credentials.
    pub uri: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl NatsConfig {
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        let mut plain = options.clone();
        plain
            .set(CREDENTIAL_USERNAME, "")
            .set(CREDENTIAL_PASSWORD, "");

        Ok(NatsConfig {
            uri: connection_uri(&plain, NATS_SCHEME, NATS_PORT)?,
            name: options.get(OPTIONS_CLIENT_ID).map(str::to_owned),
            username: options.get(CREDENTIAL_USERNAME).map(str::to_owned),
            password: options.get(CREDENTIAL_PASSWORD).map(str::to_owned),
        })
    }

    pub(crate) fn native(&self, common: &CommonOptions) -> ConnectOptions {
        let reconnect = common.reconnect_timeout;
        let mut native = ConnectOptions::new()
            .connection_timeout(common.connect_timeout)
            .max_reconnects(Some(common.max_reconnect as usize))
            .reconnect_delay_callback(move |_| reconnect);

        if let Some(name) = &self.name {
            native = native.name(name);
        }
        if let Some(username) = &self.username {
            native = native.user_and_password(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }
        native
    }
}

/// Queue-level NATS settings. A non-empty `group` subscribes through a queue
/// group, so each message reaches one member of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsSettings {
    pub topic: String,
    pub group: String,
}

impl NatsSettings {
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        Ok(NatsSettings {
            topic: options.require(TOPIC)?.to_owned(),
            group: options.get_or(GROUP, "").to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CONNECTION_HOST, CONNECTION_PORT};

    #[test]
    fn test_credentials_stay_out_of_uri() {
        let options = ConnectionOptions::from_tuples(&[
            (CONNECTION_HOST, "nats-1"),
            (CREDENTIAL_USERNAME, "svc"),
            (CREDENTIAL_PASSWORD, "secret"),
            (OPTIONS_CLIENT_ID, "billing"),
        ]);
        let config = NatsConfig::from_options(&options).unwrap();

        assert_eq!(config.uri, "nats://nats-1:4222");
        assert_eq!(config.username.as_deref(), Some("svc"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.name.as_deref(), Some("billing"));
    }

    #[test]
    fn test_custom_port() {
        let options = ConnectionOptions::from_tuples(&[
            (CONNECTION_HOST, "localhost"),
            (CONNECTION_PORT, "14222"),
        ]);
        let config = NatsConfig::from_options(&options).unwrap();

        assert_eq!(config.uri, "nats://localhost:14222");
        assert_eq!(config.username, None);
        assert_eq!(config.name, None);
    }

    #[test]
    fn test_settings() {
        assert!(matches!(
            NatsSettings::from_options(&ConnectionOptions::new()),
            Err(MessagingError::ConfigError(_))
        ));

        let settings = NatsSettings::from_options(&ConnectionOptions::from_tuples(&[
            (TOPIC, "orders.>"),
            (GROUP, "workers"),
        ]))
        .unwrap();
        assert_eq!(settings.topic, "orders.>");
        assert_eq!(settings.group, "workers");
    }
}
