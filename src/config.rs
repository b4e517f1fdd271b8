// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Options
//!
//! Connections are configured from a flat key-value bag resolved by an external
//! collaborator. This module provides that bag, the resolver contract, and the
//! helpers the broker adapters use to turn it into a connection URI and typed
//! settings.

use crate::errors::MessagingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

pub const CONNECTION_URI: &str = "connection.uri";
pub const CONNECTION_HOST: &str = "connection.host";
pub const CONNECTION_PORT: &str = "connection.port";
pub const CONNECTION_PROTOCOL: &str = "connection.protocol";
pub const CREDENTIAL_USERNAME: &str = "credential.username";
pub const CREDENTIAL_PASSWORD: &str = "credential.password";

pub const OPTIONS_RETRIES: &str = "options.retries";
pub const OPTIONS_CONNECT_TIMEOUT: &str = "options.connect_timeout";
pub const OPTIONS_RECONNECT_TIMEOUT: &str = "options.reconnect_timeout";
pub const OPTIONS_MAX_RECONNECT: &str = "options.max_reconnect";
pub const OPTIONS_SUBSCRIBE_TIMEOUT: &str = "options.subscribe_timeout";
pub const OPTIONS_RECEIVE_INTERVAL: &str = "options.receive_interval";
pub const OPTIONS_AUTO_CREATE: &str = "options.auto_create";
pub const OPTIONS_CLIENT_ID: &str = "options.client_id";

pub const TOPIC: &str = "topic";
pub const GROUP: &str = "group";

/// Environment prefix read by [`ConnectionOptions::from_env`].
pub const ENV_PREFIX: &str = "MESSAGING__";

/// Flat, case-insensitive key-value bag of connection options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ConnectionOptions {
    values: BTreeMap<String, String>,
}

impl From<BTreeMap<String, String>> for ConnectionOptions {
    fn from(map: BTreeMap<String, String>) -> Self {
        let mut options = ConnectionOptions::default();
        for (key, value) in map {
            options.set(&key, value);
        }
        options
    }
}

impl From<ConnectionOptions> for BTreeMap<String, String> {
    fn from(options: ConnectionOptions) -> Self {
        options.values
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an options bag from `(key, value)` pairs.
    ///
    /// # Example
    /// ```
    /// use messaging::config::ConnectionOptions;
    ///
    /// let options = ConnectionOptions::from_tuples(&[
    ///     ("connection.host", "localhost"),
    ///     ("connection.port", "5672"),
    /// ]);
    /// assert_eq!(options.get("Connection.Host"), Some("localhost"));
    /// ```
    pub fn from_tuples(pairs: &[(&str, &str)]) -> Self {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set(key, *value);
        }
        options
    }

    /// Reads every `MESSAGING__*` environment variable. Double underscores separate
    /// sections, so `MESSAGING__CONNECTION__HOST` becomes `connection.host`.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub(crate) fn from_vars(vars: impl Iterator<Item = (String, String)>) -> Self {
        let mut options = Self::default();
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                options.set(&key.replace("__", "."), value);
            }
        }
        options
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_lowercase(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns a non-empty value for the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_as_u64(&self, key: &str) -> Result<Option<u64>, MessagingError> {
        self.parse(key)
    }

    pub fn get_as_u64_or(&self, key: &str, default: u64) -> Result<u64, MessagingError> {
        Ok(self.get_as_u64(key)?.unwrap_or(default))
    }

    pub fn get_as_u16(&self, key: &str) -> Result<Option<u16>, MessagingError> {
        self.parse(key)
    }

    pub fn get_as_bool_or(&self, key: &str, default: bool) -> Result<bool, MessagingError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
            Some(v) => Err(MessagingError::ConfigError(format!(
                "`{}` is not a boolean: {}",
                key, v
            ))),
        }
    }

    /// Reads a duration expressed in milliseconds.
    pub fn get_as_duration_or(
        &self,
        key: &str,
        default: Duration,
    ) -> Result<Duration, MessagingError> {
        Ok(self
            .get_as_u64(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    /// Returns the value or a `ConfigError` naming the missing key.
    pub fn require(&self, key: &str) -> Result<&str, MessagingError> {
        self.get(key)
            .ok_or_else(|| MessagingError::ConfigError(format!("`{}` is required", key)))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a new bag where `overrides` win over the values in `self`.
    pub fn merge(&self, overrides: &ConnectionOptions) -> ConnectionOptions {
        let mut merged = self.clone();
        for (key, value) in &overrides.values {
            merged.values.insert(key.clone(), value.clone());
        }
        merged
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, MessagingError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| {
                MessagingError::ConfigError(format!("`{}` has an invalid value: {}", key, v))
            }),
        }
    }
}

/// Resolves connection and credential parameters from whatever source the
/// application uses (static config, discovery, secret stores).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self) -> Result<ConnectionOptions, MessagingError>;
}

#[async_trait]
impl ConnectionResolver for ConnectionOptions {
    async fn resolve(&self) -> Result<ConnectionOptions, MessagingError> {
        Ok(self.clone())
    }
}

/// Tuning shared by every broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonOptions {
    pub retries: u64,
    pub connect_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub max_reconnect: u64,
    pub subscribe_timeout: Duration,
    pub receive_interval: Duration,
}

impl Default for CommonOptions {
    fn default() -> Self {
        CommonOptions {
            retries: 3,
            connect_timeout: Duration::from_millis(30_000),
            reconnect_timeout: Duration::from_millis(1_000),
            max_reconnect: 3,
            subscribe_timeout: Duration::from_millis(10_000),
            receive_interval: Duration::from_millis(100),
        }
    }
}

impl CommonOptions {
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, MessagingError> {
        let defaults = CommonOptions::default();
        let common = CommonOptions {
            retries: options.get_as_u64_or(OPTIONS_RETRIES, defaults.retries)?,
            connect_timeout: options
                .get_as_duration_or(OPTIONS_CONNECT_TIMEOUT, defaults.connect_timeout)?,
            reconnect_timeout: options
                .get_as_duration_or(OPTIONS_RECONNECT_TIMEOUT, defaults.reconnect_timeout)?,
            max_reconnect: options.get_as_u64_or(OPTIONS_MAX_RECONNECT, defaults.max_reconnect)?,
            subscribe_timeout: options
                .get_as_duration_or(OPTIONS_SUBSCRIBE_TIMEOUT, defaults.subscribe_timeout)?,
            receive_interval: options
                .get_as_duration_or(OPTIONS_RECEIVE_INTERVAL, defaults.receive_interval)?,
        };

        if common.receive_interval.is_zero() {
            return Err(MessagingError::ConfigError(format!(
                "`{}` must be greater than zero",
                OPTIONS_RECEIVE_INTERVAL
            )));
        }

        Ok(common)
    }
}

/// Builds a broker URI from `connection.uri`, or from host/port and credentials.
///
/// Credentials given separately are only used when the URI does not embed them.
pub fn connection_uri(
    options: &ConnectionOptions,
    default_scheme: &str,
    default_port: u16,
) -> Result<String, MessagingError> {
    if let Some(uri) = options.get(CONNECTION_URI) {
        if !uri.contains("://") {
            return Err(MessagingError::ConfigError(format!(
                "`{}` must include a scheme: {}",
                CONNECTION_URI, uri
            )));
        }
        return Ok(uri.to_owned());
    }

    let host = options.get(CONNECTION_HOST).ok_or_else(|| {
        MessagingError::ConfigError(format!(
            "either `{}` or `{}` must be set",
            CONNECTION_URI, CONNECTION_HOST
        ))
    })?;
    let port = options.get_as_u16(CONNECTION_PORT)?.unwrap_or(default_port);
    let scheme = options.get_or(CONNECTION_PROTOCOL, default_scheme);

    let auth = match (
        options.get(CREDENTIAL_USERNAME),
        options.get(CREDENTIAL_PASSWORD),
    ) {
        (Some(user), Some(password)) => format!("{}:{}@", user, password),
        (Some(user), None) => format!("{}@", user),
        (None, Some(_)) => {
            return Err(MessagingError::ConfigError(format!(
                "`{}` is set without `{}`",
                CREDENTIAL_PASSWORD, CREDENTIAL_USERNAME
            )))
        }
        (None, None) => String::new(),
    };

    Ok(format!("{}://{}{}:{}", scheme, auth, host, port))
}

/// Strips credentials from a URI before it is logged or put in an error.
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &uri[..scheme_end + 3], &uri[at..])
        }
        _ => uri.to_owned(),
    }
}
