// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of Fluent Bit msgpack chunks into records.
//!
//! A chunk is a concatenation of msgpack values, one per entry. Each entry is a 2-element array
//! `[timestamp, fields]` where the timestamp is normally the EventTime extension (type 0, 8 bytes:
//! big-endian `u32` seconds followed by a big-endian `u32` sub-second word) and `fields` is a map
//! of string or binary keys to string or binary values.
//!
//! Decoding is lazy and stops at the end of the chunk. The first malformed entry is reported once
//! and ends the iteration; the entries before it remain usable.

use std::collections::HashMap;
use std::io::Cursor;
use std::iter::FusedIterator;

use rmpv::Value;

use crate::errors::{DecodeError, ExtensionError};
use crate::record::{Record, RecordOptions};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Read/write capability of a msgpack extension type.
pub trait ExtensionCodec: Sized {
    const EXT_TYPE: i8;

    fn read_ext(ext_type: i8, payload: &[u8]) -> Result<Self, ExtensionError>;

    fn write_ext(&self) -> Result<Vec<u8>, ExtensionError>;
}

/// Timestamp of an entry with nanosecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    pub seconds: u32,
    pub nanos: u32,
}

impl EventTime {
    pub const PAYLOAD_LEN: usize = 8;

    pub fn new(seconds: u32, nanos: u32) -> Self {
        EventTime { seconds, nanos }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_float(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
            return None;
        }
        let seconds = value.trunc();
        let nanos = ((value - seconds) * NANOS_PER_SECOND) as u32;
        Some(EventTime::new(seconds as u32, nanos))
    }
}

impl ExtensionCodec for EventTime {
    const EXT_TYPE: i8 = 0;

    fn read_ext(ext_type: i8, payload: &[u8]) -> Result<Self, ExtensionError> {
        if ext_type != Self::EXT_TYPE {
            return Err(ExtensionError::Type {
                expected: Self::EXT_TYPE,
                found: ext_type,
            });
        }
        let bytes: [u8; Self::PAYLOAD_LEN] =
            payload.try_into().map_err(|_| ExtensionError::Length {
                expected: Self::PAYLOAD_LEN,
                found: payload.len(),
            })?;
        let seconds = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let nanos = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(EventTime::new(seconds, nanos))
    }

    // Only inbound timestamps are ever decoded.
    fn write_ext(&self) -> Result<Vec<u8>, ExtensionError> {
        Err(ExtensionError::Unsupported(Self::EXT_TYPE))
    }
}

/// One decoded entry. The record already carries its `id` and time field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub timestamp: EventTime,
    pub record: Record,
}

/// Lazy decoder over a single chunk.
pub struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
    options: &'a RecordOptions,
    index: usize,
    done: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], options: &'a RecordOptions) -> Self {
        Decoder {
            cursor: Cursor::new(data),
            options,
            index: 0,
            done: false,
        }
    }

    fn exhausted(&self) -> bool {
        usize::try_from(self.cursor.position()).map_or(true, |position| {
            position >= self.cursor.get_ref().len()
        })
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<DecodedEntry, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.exhausted() {
            self.done = true;
            return None;
        }

        let index = self.index;
        self.index += 1;

        let result = rmpv::decode::read_value(&mut self.cursor)
            .map_err(DecodeError::from)
            .and_then(|value| decode_entry(value, index, self.options));
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

impl FusedIterator for Decoder<'_> {}

/// Decodes a whole chunk, keeping every entry decoded before the first error.
pub fn decode_all(
    data: &[u8],
    options: &RecordOptions,
) -> (Vec<DecodedEntry>, Option<DecodeError>) {
    let mut entries = Vec::new();
    for result in Decoder::new(data, options) {
        match result {
            Ok(entry) => entries.push(entry),
            Err(e) => return (entries, Some(e)),
        }
    }
    (entries, None)
}

fn decode_entry(
    value: Value,
    index: usize,
    options: &RecordOptions,
) -> Result<DecodedEntry, DecodeError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(DecodeError::EntryShape {
                index,
                found: describe(&other),
            })
        }
    };
    let [timestamp, fields] =
        <[Value; 2]>::try_from(items).map_err(|items| DecodeError::EntryShape {
            index,
            found: format!("array of {}", items.len()),
        })?;

    let timestamp = decode_timestamp(&timestamp, index)?;

    let pairs = match fields {
        Value::Map(pairs) => pairs,
        other => {
            return Err(DecodeError::FieldMap {
                index,
                found: describe(&other),
            })
        }
    };

    // Room for the id and time fields added below.
    let mut map = HashMap::with_capacity(pairs.len() + 2);
    for (key, value) in pairs {
        let key = into_text(key).map_err(|other| DecodeError::FieldKey {
            index,
            found: describe(&other),
        })?;
        let value = match into_text(value) {
            Ok(value) => value,
            Err(other) => {
                return Err(DecodeError::FieldValue {
                    index,
                    key,
                    found: describe(&other),
                })
            }
        };
        map.insert(key, value);
    }

    let mut record = Record::new(map);
    record.assign_id();
    record.assign_time(timestamp, options);

    Ok(DecodedEntry { timestamp, record })
}

fn decode_timestamp(value: &Value, index: usize) -> Result<EventTime, DecodeError> {
    let timestamp = match value {
        Value::Ext(ext_type, payload) => Some(EventTime::read_ext(*ext_type, payload)?),
        Value::Integer(seconds) => seconds
            .as_u64()
            .and_then(|seconds| u32::try_from(seconds).ok())
            .map(|seconds| EventTime::new(seconds, 0)),
        Value::F64(seconds) => EventTime::from_float(*seconds),
        Value::F32(seconds) => EventTime::from_float(f64::from(*seconds)),
        // Newer collectors send `[timestamp, metadata]` in place of the bare timestamp.
        Value::Array(header) if header.len() == 2 && !header[0].is_array() => {
            return decode_timestamp(&header[0], index);
        }
        _ => None,
    };
    timestamp.ok_or_else(|| DecodeError::Timestamp {
        index,
        found: describe(value),
    })
}

fn into_text(value: Value) -> Result<String, Value> {
    match value {
        Value::String(text) => Ok(match text.as_str() {
            Some(text) => text.to_owned(),
            None => String::from_utf8_lossy(text.as_bytes()).into_owned(),
        }),
        Value::Binary(bytes) => Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }),
        other => Err(other),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(_) => "boolean".to_string(),
        Value::Integer(_) => "integer".to_string(),
        Value::F32(_) | Value::F64(_) => "float".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Binary(_) => "binary".to_string(),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Map(pairs) => format!("map of {}", pairs.len()),
        Value::Ext(ext_type, payload) => {
            format!("extension type {ext_type} of {} bytes", payload.len())
        }
    }
}
