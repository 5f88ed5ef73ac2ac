// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the Solr output.

use reqwest::StatusCode;

/// Failure while decoding one msgpack envelope.
///
/// A decode error is scoped to the envelope it came from. Entries decoded before the error are
/// still valid and are forwarded as usual.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed msgpack data: {0}")]
    Msgpack(#[from] rmpv::decode::Error),

    #[error("entry {index}: expected a 2-element array, got {found}")]
    EntryShape { index: usize, found: String },

    #[error("entry {index}: unsupported timestamp {found}")]
    Timestamp { index: usize, found: String },

    #[error("entry {index}: expected a map of fields, got {found}")]
    FieldMap { index: usize, found: String },

    #[error("entry {index}: field key must be a string, got {found}")]
    FieldKey { index: usize, found: String },

    #[error("entry {index}: value of field '{key}' must be a string, got {found}")]
    FieldValue {
        index: usize,
        key: String,
        found: String,
    },

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

/// Failure while reading or writing a msgpack extension value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension type {found} is not supported, expected {expected}")]
    Type { expected: i8, found: i8 },

    #[error("extension payload must be {expected} bytes, got {found}")]
    Length { expected: usize, found: usize },

    #[error("encoding extension type {0} is not supported")]
    Unsupported(i8),
}

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key '{0}'")]
    Missing(&'static str),

    #[error("invalid value '{value}' for configuration key '{key}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure while shipping a batch to Solr.
#[derive(Debug, thiserror::Error)]
pub enum SolrError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to serialize batch: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("request to Solr failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Solr responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Failure while bringing up the output.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solr(#[from] SolrError),

    #[error("failed to bind envelope listener: {0}")]
    Bind(#[from] std::io::Error),
}
