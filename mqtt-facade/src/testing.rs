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

//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::Level;
use rumqttc::QoS;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::logging::{Field, StructuredLogger};

#[derive(Debug, Clone)]
pub struct Entry {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(&'static str, Option<String>)>,
}

impl Entry {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Logger capturing every entry in memory.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<Entry>>,
}

impl MemoryLogger {
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    fn push(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        self.entries.lock().unwrap().push(Entry {
            level,
            message: message.to_string(),
            fields: fields
                .iter()
                .map(|f| (f.key, f.value.map(str::to_string)))
                .collect(),
        });
    }
}

impl StructuredLogger for MemoryLogger {
    fn info(&self, message: &str, fields: &[Field<'_>]) {
        self.push(Level::Info, message, fields);
    }

    fn error(&self, message: &str, fields: &[Field<'_>]) {
        self.push(Level::Error, message, fields);
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// In-memory [`Connection`] acknowledging everything unless told otherwise.
#[derive(Default)]
pub struct MockConnection {
    pub published: Mutex<Vec<Published>>,
    pub subscribed: Mutex<Vec<(String, QoS)>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub disconnects: Mutex<usize>,
    rejected_filters: Mutex<HashSet<String>>,
    closed: Mutex<bool>,
}

impl MockConnection {
    /// Answer SUBSCRIBE requests for `filter` with a failure return code.
    pub fn reject(&self, filter: &str) {
        self.rejected_filters.lock().unwrap().insert(filter.to_string());
    }

    /// Fail every later publish as if the link dropped before the ack.
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        if *self.closed.lock().unwrap() {
            return Err(Error::ConnectionClosed);
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        if self.rejected_filters.lock().unwrap().contains(filter) {
            return Err(Error::SubscribeRejected(filter.to_string()));
        }
        self.subscribed.lock().unwrap().push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.unsubscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) {
        *self.disconnects.lock().unwrap() += 1;
    }
}
