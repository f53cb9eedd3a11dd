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

//! Error type shared by configuration, publishing and subscribing.

use thiserror::Error;

/// Errors returned by [`MqttClient`](crate::MqttClient) and its configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// A required connection field was left empty.
    #[error("{0} must be set")]
    MissingField(&'static str),

    /// The broker address could not be split into host and port.
    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    /// QoS level outside of 0, 1 or 2.
    #[error("invalid QoS level {0}, must be 0, 1 or 2")]
    InvalidQos(u8),

    /// Settings document could not be read or parsed.
    #[error("failed to load settings: {0}")]
    Settings(String),

    /// The initial handshake with the broker failed.
    #[error("MQTT connect failed: {0}")]
    Connect(String),

    /// The payload could not be converted to bytes.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request was rejected by the client before reaching the network.
    #[error("MQTT request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker answered a SUBSCRIBE with a failure return code.
    #[error("broker rejected subscription to '{0}'")]
    SubscribeRejected(String),

    /// The connection ended before the broker acknowledged the request.
    #[error("connection closed before acknowledgement")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display() {
        let err = Error::MissingField("password");
        assert_eq!(err.to_string(), "password must be set");
    }

    #[test]
    fn test_serialization_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = serde_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().starts_with("payload serialization failed"));
    }
}
