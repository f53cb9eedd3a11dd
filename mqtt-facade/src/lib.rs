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

//! Configured MQTT client with structured publish/subscribe logging.
//!
//! Wraps a `rumqttc` connection behind [`MqttClient`]: payloads are
//! normalized to bytes, every publish and delivery can be reported to a log
//! callback and a message logger, and inbound messages can pass through a
//! pre-handler before reaching the subscription handler.
//!
//! # Example
//!
//! ```ignore
//! use mqtt_facade::{Json, MqttClient, MqttClientConfig, PublishOptions, QoS};
//!
//! let config = MqttClientConfig::builder("broker.local:1883", "user", "secret", "node-1")
//!     .qos(QoS::AtLeastOnce)
//!     .pre_handler(|topic, _msg| {
//!         anyhow::ensure!(!topic.starts_with("blocked/"), "topic is blocked");
//!         Ok(())
//!     })
//!     .build();
//!
//! let client = MqttClient::connect(config).await?;
//! client
//!     .subscribe("gateway/+/read", |topic, msg| {
//!         println!("{topic}: {msg}");
//!         Ok(())
//!     })
//!     .await?;
//! client.publish("gateway/42/read", Json(&reading)).await?;
//! client
//!     .publish_with("heartbeat", "ok", PublishOptions::new().without_log())
//!     .await?;
//! client.disconnect().await;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
mod dispatcher;
pub mod error;
pub mod logging;
pub mod options;
pub mod payload;

#[cfg(test)]
mod testing;

pub use client::MqttClient;
pub use config::{MessageHandler, MqttClientConfig, MqttClientConfigBuilder, MqttSettings};
pub use connection::Connection;
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use logging::{Direction, Field, LogEvent, LogHandler, StructuredLogger, TargetLogger};
pub use options::{CallOptions, PublishOptions, SubscribeOptions};
pub use payload::{IntoPayload, Json};
pub use rumqttc::QoS;
