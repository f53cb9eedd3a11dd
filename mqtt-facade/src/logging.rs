// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structured logging hooks.
//!
//! A client carries up to two [`StructuredLogger`]s: one for connection
//! lifecycle events and one for message traffic. [`TargetLogger`] is the
//! default implementation and forwards entries to the `log` facade with the
//! fields attached as key/values.

use std::fmt;
use std::sync::Arc;

use log::kv::{Key, Source, ToValue, VisitSource};
use log::{Level, Record};

/// A single key/value attached to a structured log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub key: &'static str,
    pub value: Option<&'a str>,
}

impl<'a> Field<'a> {
    pub fn new(key: &'static str, value: &'a str) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// A field whose value may be absent, e.g. `error` on a successful call.
    pub fn optional(key: &'static str, value: Option<&'a str>) -> Self {
        Self { key, value }
    }
}

/// Logger receiving structured entries with an info and an error channel.
pub trait StructuredLogger: Send + Sync {
    fn info(&self, message: &str, fields: &[Field<'_>]);
    fn error(&self, message: &str, fields: &[Field<'_>]);
}

/// [`StructuredLogger`] writing to the `log` facade under a fixed target.
#[derive(Debug, Clone)]
pub struct TargetLogger {
    target: String,
}

impl TargetLogger {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn emit(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let kvs = Fields(fields);
        log::logger().log(
            &Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(&self.target)
                .module_path_static(Some(module_path!()))
                .key_values(&kvs)
                .build(),
        );
    }
}

impl StructuredLogger for TargetLogger {
    fn info(&self, message: &str, fields: &[Field<'_>]) {
        self.emit(Level::Info, message, fields);
    }

    fn error(&self, message: &str, fields: &[Field<'_>]) {
        self.emit(Level::Error, message, fields);
    }
}

struct Fields<'a>(&'a [Field<'a>]);

impl Source for Fields<'_> {
    fn visit<'kvs>(&'kvs self, visitor: &mut dyn VisitSource<'kvs>) -> Result<(), log::kv::Error> {
        for field in self.0 {
            visitor.visit_pair(Key::from_str(field.key), field.value.to_value())?;
        }
        Ok(())
    }
}

/// Direction of the traffic a [`LogEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Pub,
    Sub,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pub => "pub",
            Direction::Sub => "sub",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published or received message, as reported to the log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEvent<'a> {
    pub direction: Direction,
    pub topic: &'a str,
    pub message: &'a str,
    pub error: Option<&'a str>,
}

/// Callback invoked for every logged publish and delivery.
pub type LogHandler = Arc<dyn Fn(&LogEvent<'_>) + Send + Sync>;

/// Reports a message to the log callback and the message logger.
pub(crate) fn record_traffic(
    log_handler: Option<&LogHandler>,
    message_logger: Option<&Arc<dyn StructuredLogger>>,
    event: &LogEvent<'_>,
) {
    if let Some(handler) = log_handler {
        handler(event);
    }
    if let Some(logger) = message_logger {
        logger.info(
            event.message,
            &[
                Field::new("type", event.direction.as_str()),
                Field::new("topic", event.topic),
                Field::optional("error", event.error),
            ],
        );
    }
}
