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

//! Configuration types for the MQTT client.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::{LogEvent, LogHandler, StructuredLogger, TargetLogger};

pub const DEFAULT_PORT: u16 = 1883;
pub const CLIENT_LOGGER_TARGET: &str = "mqtt-client";
pub const MESSAGE_LOGGER_TARGET: &str = "mqtt-message";

/// Handler for inbound messages: `(topic, message)`.
///
/// Used both per subscription and as the client-wide pre-handler.
pub type MessageHandler = Arc<dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync>;

/// Configuration for [`MqttClient`](crate::MqttClient).
#[derive(Clone)]
pub struct MqttClientConfig {
    /// Broker address as `host:port` (port defaults to 1883).
    pub addr: String,
    pub username: String,
    pub password: String,
    /// Client identifier; must be unique per broker.
    pub client_id: String,
    pub clean_session: bool,
    /// QoS used when a call does not override it.
    pub qos: QoS,
    /// Route per-event driver diagnostics to the client logger.
    pub debug: bool,
    /// Deliver each subscription's messages one at a time, in arrival order.
    /// Off by default so a slow handler does not hold back its backlog.
    pub ordered_delivery: bool,
    pub keep_alive: Duration,
    /// Capacity of the request channel between the client and its event loop.
    pub request_capacity: usize,
    /// Runs before every subscription handler; an error skips the handler.
    pub pre_handler: Option<MessageHandler>,
    pub log_handler: Option<LogHandler>,
    /// Connection lifecycle and driver diagnostics.
    pub client_logger: Option<Arc<dyn StructuredLogger>>,
    /// Published and received messages.
    pub message_logger: Option<Arc<dyn StructuredLogger>>,
}

impl MqttClientConfig {
    /// Start building a new config with the required fields.
    pub fn builder(
        addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        client_id: impl Into<String>,
    ) -> MqttClientConfigBuilder {
        MqttClientConfigBuilder {
            addr: addr.into(),
            username: username.into(),
            password: password.into(),
            client_id: client_id.into(),
            clean_session: false,
            qos: QoS::AtMostOnce,
            debug: false,
            ordered_delivery: false,
            keep_alive: Duration::from_secs(30),
            request_capacity: 100,
            pre_handler: None,
            log_handler: None,
            client_logger: None,
            message_logger: None,
        }
    }

    /// Start a builder from externally provided settings, with `log`-backed
    /// client and message loggers installed.
    pub fn from_settings(settings: &MqttSettings) -> Result<MqttClientConfigBuilder> {
        let mqtt = &settings.mqtt;
        let mut builder = Self::builder(
            &mqtt.addr,
            &mqtt.user_name,
            &mqtt.password,
            &settings.cluster.node_name,
        )
        .clean_session(mqtt.clean_session)
        .qos(qos_from_level(mqtt.qos)?)
        .debug(mqtt.debug)
        .ordered_delivery(mqtt.ordered_delivery)
        .client_logger(Arc::new(TargetLogger::new(CLIENT_LOGGER_TARGET)))
        .message_logger(Arc::new(TargetLogger::new(MESSAGE_LOGGER_TARGET)));
        if let Some(secs) = mqtt.keep_alive {
            builder = builder.keep_alive(Duration::from_secs(secs));
        }
        Ok(builder)
    }

    /// Check required fields and resolve the broker address.
    pub(crate) fn validate(&self) -> Result<BrokerAddress> {
        if self.username.is_empty() {
            return Err(Error::MissingField("username"));
        }
        if self.password.is_empty() {
            return Err(Error::MissingField("password"));
        }
        if self.client_id.is_empty() {
            return Err(Error::MissingField("client_id"));
        }
        BrokerAddress::parse(&self.addr)
    }
}

impl fmt::Debug for MqttClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttClientConfig")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("qos", &self.qos)
            .field("debug", &self.debug)
            .field("ordered_delivery", &self.ordered_delivery)
            .field("keep_alive", &self.keep_alive)
            .field("request_capacity", &self.request_capacity)
            .field("pre_handler", &self.pre_handler.is_some())
            .field("log_handler", &self.log_handler.is_some())
            .field("client_logger", &self.client_logger.is_some())
            .field("message_logger", &self.message_logger.is_some())
            .finish()
    }
}

/// Builder for [`MqttClientConfig`].
pub struct MqttClientConfigBuilder {
    addr: String,
    username: String,
    password: String,
    client_id: String,
    clean_session: bool,
    qos: QoS,
    debug: bool,
    ordered_delivery: bool,
    keep_alive: Duration,
    request_capacity: usize,
    pre_handler: Option<MessageHandler>,
    log_handler: Option<LogHandler>,
    client_logger: Option<Arc<dyn StructuredLogger>>,
    message_logger: Option<Arc<dyn StructuredLogger>>,
}

impl MqttClientConfigBuilder {
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn ordered_delivery(mut self, ordered: bool) -> Self {
        self.ordered_delivery = ordered;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    pub fn pre_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre_handler = Some(Arc::new(handler));
        self
    }

    pub fn log_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&LogEvent<'_>) + Send + Sync + 'static,
    {
        self.log_handler = Some(Arc::new(handler));
        self
    }

    pub fn client_logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.client_logger = Some(logger);
        self
    }

    pub fn message_logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.message_logger = Some(logger);
        self
    }

    /// Build the config.
    pub fn build(self) -> MqttClientConfig {
        MqttClientConfig {
            addr: self.addr,
            username: self.username,
            password: self.password,
            client_id: self.client_id,
            clean_session: self.clean_session,
            qos: self.qos,
            debug: self.debug,
            ordered_delivery: self.ordered_delivery,
            keep_alive: self.keep_alive,
            request_capacity: self.request_capacity,
            pre_handler: self.pre_handler,
            log_handler: self.log_handler,
            client_logger: self.client_logger,
            message_logger: self.message_logger,
        }
    }
}

/// Broker host and port resolved from a `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub(crate) fn parse(addr: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(addr.to_string());
        let trimmed = addr
            .trim()
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");

        let (host, port) = if let Some(bracketed) = trimmed.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => rest
                    .strip_prefix(':')
                    .and_then(|port| port.parse::<u16>().ok())
                    .ok_or_else(invalid)?,
            };
            (host, port)
        } else {
            match trimmed.rsplit_once(':') {
                // Bare IPv6 literal has no port.
                Some((host, _)) if host.contains(':') => (trimmed, DEFAULT_PORT),
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
                None => (trimmed, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Map a numeric QoS level onto [`QoS`].
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidQos(other)),
    }
}

/// Settings as supplied by an external configuration provider.
///
/// Mirrors the keys `mqtt.addr`, `mqtt.userName`, `mqtt.password`,
/// `mqtt.cleanSession`, `mqtt.qos`, `mqtt.debug` and `cluster.nodeName`
/// (used as the client identifier).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub mqtt: MqttSection,
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MqttSection {
    pub addr: String,
    pub user_name: String,
    pub password: String,
    pub clean_session: bool,
    pub qos: u8,
    pub debug: bool,
    /// Keep-alive in seconds.
    pub keep_alive: Option<u64>,
    pub ordered_delivery: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSection {
    pub node_name: String,
}

impl MqttSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Settings(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Settings(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }
}
