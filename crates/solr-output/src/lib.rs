// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered log output for Solr.
//!
//! Msgpack envelopes of `[timestamp, {field: value}]` entries are decoded into flat records,
//! buffered, and posted to a Solr collection's update handler in batches. A batch is flushed when
//! the buffer fills up or on a timer, retried a bounded number of times, and dropped through a
//! failure callback once every attempt failed.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod codec;
pub mod config;
pub mod errors;
pub mod listener;
pub mod output;
pub mod processor;
pub mod record;
pub mod solr;
