// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output configuration.
//!
//! Options are read by key through a lookup function, the way a log collector hands plugin
//! settings over. [`Config::from_env`] backs the lookup with `SOLR_OUTPUT_*` environment
//! variables (`MaxBufferSize` is read from `SOLR_OUTPUT_MAX_BUFFER_SIZE`). Empty values count as
//! unset.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::errors::ConfigError;
use crate::listener::ListenerConfig;
use crate::record::{RecordOptions, TimeFormat};
use crate::solr::SolrConfig;

pub const ENV_PREFIX: &str = "SOLR_OUTPUT_";

pub const KEY_URL: &str = "Url";
pub const KEY_COLLECTION: &str = "Collection";
pub const KEY_CONTEXT: &str = "Context";
pub const KEY_COMMIT: &str = "Commit";
pub const KEY_TIMEOUT: &str = "Timeout";
pub const KEY_HTTPS_PROXY: &str = "HttpsProxy";
pub const KEY_MAX_BUFFER_SIZE: &str = "MaxBufferSize";
pub const KEY_MAX_RETRIES: &str = "MaxRetries";
pub const KEY_RETRY_INTERVAL: &str = "RetryInterval";
pub const KEY_TIME_BASED_PROCESSING: &str = "TimeBasedProcessing";
pub const KEY_PROCESS_INTERVAL: &str = "ProcessInterval";
pub const KEY_USE_EPOCH_TIME: &str = "UseEpochTime";
pub const KEY_TIME_FIELD_NAME: &str = "TimeFieldName";
pub const KEY_LISTEN_HOST: &str = "ListenHost";
pub const KEY_LISTEN_PORT: &str = "ListenPort";
pub const KEY_MAX_ENVELOPE_BYTES: &str = "MaxEnvelopeBytes";
pub const KEY_READ_TIMEOUT: &str = "ReadTimeout";
pub const KEY_MAX_CONNECTIONS: &str = "MaxConnections";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub solr: SolrConfig,
    pub batch: BatchConfig,
    pub record: RecordOptions,
    pub listener: ListenerConfig,
}

impl Config {
    /// Reads the configuration from `SOLR_OUTPUT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(env_var_name(key)).ok())
    }

    /// Reads the configuration through `lookup`, which maps an option key to its raw value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let options = Options { lookup };

        let solr_defaults = SolrConfig::default();
        let solr = SolrConfig {
            url: options.required(KEY_URL)?,
            context: options
                .get(KEY_CONTEXT)
                .unwrap_or(solr_defaults.context),
            collection: options.required(KEY_COLLECTION)?,
            commit: options.parse_bool(KEY_COMMIT, solr_defaults.commit)?,
            timeout: options.parse_seconds(KEY_TIMEOUT, solr_defaults.timeout)?,
            https_proxy: options.get(KEY_HTTPS_PROXY),
        };

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            max_buffer_size: options
                .parse(KEY_MAX_BUFFER_SIZE, batch_defaults.max_buffer_size)?,
            max_retries: options.parse(KEY_MAX_RETRIES, batch_defaults.max_retries)?,
            retry_interval: options
                .parse_seconds(KEY_RETRY_INTERVAL, batch_defaults.retry_interval)?,
            time_based_processing: options.parse_bool(
                KEY_TIME_BASED_PROCESSING,
                batch_defaults.time_based_processing,
            )?,
            process_interval: options
                .parse_seconds(KEY_PROCESS_INTERVAL, batch_defaults.process_interval)?,
        };

        let record_defaults = RecordOptions::default();
        let record = RecordOptions {
            time_format: if options.parse_bool(KEY_USE_EPOCH_TIME, false)? {
                TimeFormat::Epoch
            } else {
                TimeFormat::Formatted
            },
            time_field: options
                .get(KEY_TIME_FIELD_NAME)
                .unwrap_or(record_defaults.time_field),
        };

        let listener_defaults = ListenerConfig::default();
        let listener = ListenerConfig {
            host: options
                .get(KEY_LISTEN_HOST)
                .unwrap_or(listener_defaults.host),
            port: options.parse(KEY_LISTEN_PORT, listener_defaults.port)?,
            max_envelope_bytes: options
                .parse(KEY_MAX_ENVELOPE_BYTES, listener_defaults.max_envelope_bytes)?,
            read_timeout: options
                .parse_seconds(KEY_READ_TIMEOUT, listener_defaults.read_timeout)?,
            max_connections: options
                .parse(KEY_MAX_CONNECTIONS, listener_defaults.max_connections)?,
        };

        let config = Config {
            solr,
            batch,
            record,
            listener,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.solr.url.starts_with("http://") && !self.solr.url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: KEY_URL,
                value: self.solr.url.clone(),
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }
        if self.batch.time_based_processing && self.batch.process_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: KEY_PROCESS_INTERVAL,
                value: "0".to_string(),
                reason: "must be at least one second when time based processing is on"
                    .to_string(),
            });
        }
        if self.listener.max_envelope_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: KEY_MAX_ENVELOPE_BYTES,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.listener.read_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: KEY_READ_TIMEOUT,
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        if self.listener.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: KEY_MAX_CONNECTIONS,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Name of the environment variable backing an option key.
pub fn env_var_name(key: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    let mut previous: Option<char> = None;
    for c in key.chars() {
        if c.is_ascii_uppercase()
            && previous.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
        previous = Some(c);
    }
    name
}

struct Options<F> {
    lookup: F,
}

impl<F> Options<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn parse_seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn parse_bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match value.to_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}
