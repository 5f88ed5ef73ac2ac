// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The batch buffer and the policy deciding when it is flushed.

use std::time::Duration;

use crate::record::Record;

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 20;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PROCESS_INTERVAL: Duration = Duration::from_secs(5);

/// Flush policy of a [`BatchContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Number of buffered records that triggers an inline flush. Zero behaves like one.
    pub max_buffer_size: usize,
    /// Additional attempts after the first failed flush.
    pub max_retries: u32,
    /// Delay between two flush attempts of the same batch.
    pub retry_interval: Duration,
    /// Whether a background task also flushes every `process_interval`.
    pub time_based_processing: bool,
    pub process_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            time_based_processing: true,
            process_interval: DEFAULT_PROCESS_INTERVAL,
        }
    }
}

impl BatchConfig {
    pub fn effective_max_buffer_size(&self) -> usize {
        self.max_buffer_size.max(1)
    }

    /// Total number of `process` calls a failing batch gets.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Records waiting to be flushed, in arrival order.
#[derive(Debug, Clone)]
pub struct BatchContext {
    buffer: Vec<Record>,
    max_buffer_size: usize,
}

impl BatchContext {
    pub fn new(config: &BatchConfig) -> Self {
        let max_buffer_size = config.effective_max_buffer_size();
        BatchContext {
            buffer: Vec::with_capacity(max_buffer_size),
            max_buffer_size,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.buffer.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_buffer_size
    }

    /// Drops every buffered record, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
