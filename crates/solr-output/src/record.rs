// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoded log records and the rendering of their time field.

use std::collections::HashMap;

use chrono::DateTime;
use serde::Serialize;
use uuid::Uuid;

use crate::codec::EventTime;

/// Field holding the synthetic record identifier.
pub const ID_FIELD: &str = "id";

/// Field the decoded timestamp is written to unless configured otherwise.
pub const DEFAULT_TIME_FIELD: &str = "logtime";

const FORMATTED_TIME_PATTERN: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// A single log record: a flat map of field names to textual values.
///
/// Records are created by the decoder and are not mutated once they have been handed to the
/// batch processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Record { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Returns the synthetic identifier assigned at decode time.
    pub fn id(&self) -> Option<&str> {
        self.get(ID_FIELD)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Assigns a fresh random identifier. Not derived from the record content.
    pub(crate) fn assign_id(&mut self) {
        self.fields
            .insert(ID_FIELD.to_string(), Uuid::new_v4().to_string());
    }

    pub(crate) fn assign_time(&mut self, timestamp: EventTime, options: &RecordOptions) {
        self.fields.insert(
            options.time_field.clone(),
            render_time(timestamp, options.time_format),
        );
    }
}

/// How the decoded timestamp is written into the time field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeFormat {
    /// Whole epoch seconds, e.g. `1000`.
    Epoch,
    /// `YYYY-MM-DDThh:mm:ss.mmm` in UTC, sub-second part truncated to milliseconds.
    #[default]
    Formatted,
}

/// Per-record options applied by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOptions {
    pub time_format: TimeFormat,
    pub time_field: String,
}

impl Default for RecordOptions {
    fn default() -> Self {
        RecordOptions {
            time_format: TimeFormat::default(),
            time_field: DEFAULT_TIME_FIELD.to_string(),
        }
    }
}

/// Renders a timestamp according to `format`.
pub fn render_time(timestamp: EventTime, format: TimeFormat) -> String {
    match format {
        TimeFormat::Epoch => timestamp.seconds.to_string(),
        TimeFormat::Formatted => {
            let seconds = i64::from(timestamp.seconds);
            // An out of range sub-second word falls back to the whole second.
            match DateTime::from_timestamp(seconds, timestamp.nanos)
                .or_else(|| DateTime::from_timestamp(seconds, 0))
            {
                Some(datetime) => datetime.format(FORMATTED_TIME_PATTERN).to_string(),
                None => timestamp.seconds.to_string(),
            }
        }
    }
}
